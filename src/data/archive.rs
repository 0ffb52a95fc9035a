//! Archive documents (`<device>.archive.yaml`) describing what a device recorded.
//!
//! Two strategies, chosen per device class:
//!
//! - **Sensors** ([`SensorArchive`]): the whole document is composed in memory from
//!   the sensor template and written as a full overwrite. Composition is a pure
//!   function of the template, the log file name, the channel names and the
//!   comment, so repeated writes are byte-identical.
//! - **Cameras** ([`CameraArchive`]): the camera template is copied verbatim, a
//!   header is appended inside its trailing `data` section, and one `images_list`
//!   entry is appended and flushed per saved image. A crash loses at most the
//!   entry being written.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// File name of the sensor template inside the template directory.
pub const SENSOR_TEMPLATE: &str = "archive_template_sensor.yml";
/// File name of the camera template inside the template directory.
pub const CAMERA_TEMPLATE: &str = "archive_template_camera.yml";

const SCHEMA_TEMPLATE_KEY: &str = "sensor_schema_template";
const TIMESTAMP_REL_REF: &str = "#/data/value_timestamp_rel";
const TIMESTAMP_ABS_REF: &str = "#/data/value_timestamp_abs";

/// Structural key for a channel: spaces and hyphens become underscores.
///
/// `"Operating point"` → `"Operating_point"`. The original name is kept as the
/// human-facing label in the schema.
pub fn sanitize_channel_name(channel: &str) -> String {
    channel.replace([' ', '-'], "_")
}

/// `<directory>/<device>.archive.yaml`
pub fn archive_path(directory: &Path, device: &str) -> PathBuf {
    directory.join(format!("{device}.archive.yaml"))
}

/// Read a template file from `template_dir`.
pub fn load_template(template_dir: &Path, file_name: &str) -> AppResult<String> {
    let path = template_dir.join(file_name);
    fs::read_to_string(&path).map_err(|e| {
        DaqError::Template(format!("cannot read {}: {e}", path.display()))
    })
}

// =============================================================================
// Sensor archive
// =============================================================================

/// Parsed sensor template, loaded once per device.
#[derive(Debug, Clone)]
pub struct SensorArchive {
    definitions: Value,
    data: Mapping,
    schema_template: Value,
}

impl SensorArchive {
    /// Load and check [`SENSOR_TEMPLATE`] from `template_dir`.
    pub fn load(template_dir: &Path) -> AppResult<Self> {
        Self::from_template(&load_template(template_dir, SENSOR_TEMPLATE)?)
    }

    /// Parse a sensor template.
    ///
    /// Requires `definitions.sections.Sensors_list`, a `data` mapping (may be
    /// empty) and `sensor_schema_template` with a
    /// `section.quantities.value_log.m_annotations.tabular` mapping.
    pub fn from_template(text: &str) -> AppResult<Self> {
        let mut root: Mapping = serde_yaml::from_str(text)
            .map_err(|e| DaqError::Template(format!("sensor template is not a YAML mapping: {e}")))?;

        let definitions = root
            .remove("definitions")
            .ok_or_else(|| missing_key("definitions"))?;
        let data = match root.remove("data") {
            Some(Value::Mapping(map)) => map,
            Some(Value::Null) => Mapping::new(),
            Some(_) => return Err(DaqError::Template("'data' must be a mapping".to_string())),
            None => return Err(missing_key("data")),
        };
        let schema_template = root
            .remove(SCHEMA_TEMPLATE_KEY)
            .ok_or_else(|| missing_key(SCHEMA_TEMPLATE_KEY))?;

        let archive = Self {
            definitions,
            data,
            schema_template,
        };
        // Fail on a malformed template now rather than at the end of a run.
        archive.compose("template-check.csv", ["value"], None)?;
        Ok(archive)
    }

    /// Compose the archive document for a device.
    pub fn compose<'a>(
        &self,
        data_file: &str,
        channels: impl IntoIterator<Item = &'a str>,
        comment: Option<&str>,
    ) -> AppResult<Value> {
        let mut definitions = self.definitions.clone();
        let mut data = self.data.clone();
        data.insert("data_file".into(), data_file.into());

        let sub_sections = sensor_sub_sections(&mut definitions)?;

        for channel in channels {
            let key = sanitize_channel_name(channel);

            let mut entry = Mapping::new();
            entry.insert("value_timestamp_rel".into(), TIMESTAMP_REL_REF.into());
            entry.insert("value_timestamp_abs".into(), TIMESTAMP_ABS_REF.into());
            if let Some(comment) = comment {
                entry.insert("comment".into(), comment.into());
            }
            data.insert(key.as_str().into(), Value::Mapping(entry));

            let mut schema = self.schema_template.clone();
            *tabular_name(&mut schema)? = channel.into();
            sub_sections.insert(key.into(), schema);
        }

        let mut document = Mapping::new();
        document.insert("definitions".into(), definitions);
        document.insert("data".into(), Value::Mapping(data));
        Ok(Value::Mapping(document))
    }

    /// Compose and write the archive, replacing any previous document.
    pub fn write<'a>(
        &self,
        path: &Path,
        data_file: &str,
        channels: impl IntoIterator<Item = &'a str>,
        comment: Option<&str>,
    ) -> AppResult<()> {
        let document = self.compose(data_file, channels, comment)?;
        let text = serde_yaml::to_string(&document)?;

        // Write next to the target, then swap it in.
        let mut staging = path.as_os_str().to_owned();
        staging.push(".part");
        let staging = PathBuf::from(staging);
        fs::write(&staging, text)?;
        fs::rename(&staging, path)?;

        tracing::debug!(path = %path.display(), "Sensor archive written");
        Ok(())
    }
}

fn missing_key(key: &str) -> DaqError {
    DaqError::Template(format!("sensor template has no '{key}' key"))
}

/// `definitions.sections.Sensors_list.sub_sections`, created empty if null.
fn sensor_sub_sections(definitions: &mut Value) -> AppResult<&mut Mapping> {
    let sensors_list = definitions
        .get_mut("sections")
        .and_then(|sections| sections.get_mut("Sensors_list"))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| missing_key("definitions.sections.Sensors_list"))?;

    let sub_sections = sensors_list
        .entry("sub_sections".into())
        .or_insert(Value::Null);
    if sub_sections.is_null() {
        *sub_sections = Value::Mapping(Mapping::new());
    }
    sub_sections.as_mapping_mut().ok_or_else(|| {
        DaqError::Template("'Sensors_list.sub_sections' must be a mapping".to_string())
    })
}

/// `section.quantities.value_log.m_annotations.tabular.name` of a schema copy.
fn tabular_name(schema: &mut Value) -> AppResult<&mut Value> {
    let tabular = ["section", "quantities", "value_log", "m_annotations", "tabular"]
        .iter()
        .try_fold(schema, |node, key| node.get_mut(*key))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| {
            missing_key("sensor_schema_template.section.quantities.value_log.m_annotations.tabular")
        })?;
    Ok(tabular.entry("name".into()).or_insert(Value::Null))
}

// =============================================================================
// Camera archive
// =============================================================================

/// One attached camera as listed in the archive header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSummary {
    /// Stable context id.
    pub id: usize,
    /// Camera model name.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Exposure time in microseconds.
    pub exposure_time: f64,
    /// Frame rate in Hz.
    pub frame_rate: f64,
}

#[derive(Serialize)]
struct CameraHeader<'a> {
    exposure_time: f64,
    cameras: &'a [CameraSummary],
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

/// One saved image in `data.images_list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageEntry {
    /// Image file name.
    pub name: String,
    /// Path relative to the measurement directory.
    pub image: String,
    /// Context id of the camera that took it.
    pub camera: usize,
    /// Seconds since acquisition start.
    pub timestamp_rel: f64,
    /// Formatted absolute timestamp.
    pub timestamp_abs: String,
}

/// Incrementally grown camera archive.
pub struct CameraArchive {
    path: PathBuf,
    file: File,
    entries: usize,
}

impl CameraArchive {
    /// Copy the camera template to `path` and append the header.
    ///
    /// The template's top-level `data` key must come last so that appended
    /// lines extend it. Fails with [`DaqError::OutputExists`] if `path` exists.
    pub fn create(
        template_dir: &Path,
        path: &Path,
        cameras: &[CameraSummary],
        comment: Option<&str>,
    ) -> AppResult<Self> {
        let template = load_template(template_dir, CAMERA_TEMPLATE)?;
        check_camera_template(&template)?;

        let first = cameras.first().ok_or_else(|| {
            DaqError::Configuration("camera archive needs at least one camera".to_string())
        })?;
        let header = CameraHeader {
            exposure_time: first.exposure_time,
            cameras,
            comment,
        };

        let mut file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => DaqError::OutputExists(path.to_path_buf()),
                _ => DaqError::Io(e),
            })?;

        let mut text = template;
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&indent(&serde_yaml::to_string(&header)?));
        text.push_str("  images_list:\n");
        file.write_all(text.as_bytes())?;
        file.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries: 0,
        })
    }

    /// Append one `images_list` entry and flush it.
    pub fn append_image(&mut self, entry: &ImageEntry) -> AppResult<()> {
        let item = serde_yaml::to_string(&[entry])?;
        self.file.write_all(indent(&item).as_bytes())?;
        self.file.flush()?;
        self.entries += 1;
        Ok(())
    }

    /// Location of the archive.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of image entries appended.
    pub fn entries(&self) -> usize {
        self.entries
    }
}

fn check_camera_template(text: &str) -> AppResult<()> {
    let root: Mapping = serde_yaml::from_str(text)
        .map_err(|e| DaqError::Template(format!("camera template is not a YAML mapping: {e}")))?;
    match root.iter().last() {
        Some((Value::String(key), Value::Null | Value::Mapping(_))) if key == "data" => Ok(()),
        _ => Err(DaqError::Template(
            "camera template must end with a 'data' mapping".to_string(),
        )),
    }
}

/// Indent every line by two spaces, placing it inside `data`.
fn indent(yaml: &str) -> String {
    yaml.lines().map(|line| format!("  {line}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: &str = r##"
definitions:
  name: Sensor log
  sections:
    Sensors_list:
      sub_sections: {}
data:
  m_def: "#/definitions/section_definitions/0"
sensor_schema_template:
  section:
    quantities:
      value_log:
        type: np.float64
        shape: ['*']
        m_annotations:
          tabular:
            name: placeholder
"##;

    const CAMERA: &str = "definitions:\n  name: Camera images\ndata:\n  m_def: '#/definitions'\n";

    #[test]
    fn channel_names_are_sanitized() {
        assert_eq!(sanitize_channel_name("Operating point"), "Operating_point");
        assert_eq!(sanitize_channel_name("TE-1 K"), "TE_1_K");
        assert_eq!(sanitize_channel_name("IWT"), "IWT");
    }

    #[test]
    fn sensor_document_registers_every_channel() {
        let archive = SensorArchive::from_template(SENSOR).unwrap();
        let doc = archive
            .compose("Eurotherm.csv", ["Temperature", "Operating point"], Some("heater"))
            .unwrap();

        assert_eq!(doc["data"]["data_file"], Value::from("Eurotherm.csv"));
        assert_eq!(
            doc["data"]["Operating_point"]["value_timestamp_rel"],
            Value::from("#/data/value_timestamp_rel")
        );
        assert_eq!(doc["data"]["Temperature"]["comment"], Value::from("heater"));

        let label = &doc["definitions"]["sections"]["Sensors_list"]["sub_sections"]
            ["Operating_point"]["section"]["quantities"]["value_log"]["m_annotations"]
            ["tabular"]["name"];
        assert_eq!(label, &Value::from("Operating point"));

        assert!(doc.get(SCHEMA_TEMPLATE_KEY).is_none());
    }

    #[test]
    fn sensor_document_without_comment_has_no_comment_key() {
        let archive = SensorArchive::from_template(SENSOR).unwrap();
        let doc = archive.compose("vifcon.csv", ["IWP"], None).unwrap();
        assert!(doc["data"]["IWP"].get("comment").is_none());
    }

    #[test]
    fn sensor_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SensorArchive::from_template(SENSOR).unwrap();
        let path = archive_path(dir.path(), "Eurotherm");

        archive.write(&path, "Eurotherm.csv", ["IWT", "SWT"], None).unwrap();
        let first = fs::read(&path).unwrap();
        archive.write(&path, "Eurotherm.csv", ["IWT", "SWT"], None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn malformed_sensor_templates_are_rejected() {
        assert!(matches!(
            SensorArchive::from_template("data: {}\n"),
            Err(DaqError::Template(_))
        ));
        let no_tabular = SENSOR.replace("tabular:", "tabulated:");
        assert!(matches!(
            SensorArchive::from_template(&no_tabular),
            Err(DaqError::Template(_))
        ));
    }

    #[test]
    fn missing_template_file_is_a_template_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(SensorArchive::load(dir.path()), Err(DaqError::Template(_))));
    }

    #[test]
    fn camera_archive_grows_inside_data() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CAMERA_TEMPLATE), CAMERA).unwrap();
        let path = archive_path(dir.path(), "Basler");
        let cameras = [CameraSummary {
            id: 0,
            model: "Simulated".to_string(),
            serial_number: "SIM22000".to_string(),
            exposure_time: 5000.0,
            frame_rate: 2.0,
        }];

        let mut archive =
            CameraArchive::create(dir.path(), &path, &cameras, Some("top view")).unwrap();
        for counter in 1..=2 {
            archive
                .append_image(&ImageEntry {
                    name: format!("img_{counter:06}.jpg"),
                    image: format!("Basler/img_{counter:06}.jpg"),
                    camera: 0,
                    timestamp_rel: counter as f64,
                    timestamp_abs: "2024-03-01 08:00:01.000+00:00".to_string(),
                })
                .unwrap();
        }
        assert_eq!(archive.entries(), 2);

        let doc: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let data = &doc["data"];
        assert_eq!(data["m_def"], Value::from("#/definitions"));
        assert_eq!(data["exposure_time"], Value::from(5000.0));
        assert_eq!(data["comment"], Value::from("top view"));
        assert_eq!(data["cameras"][0]["serial_number"], Value::from("SIM22000"));
        let images = data["images_list"].as_sequence().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1]["image"], Value::from("Basler/img_000002.jpg"));
        assert_eq!(images[1]["timestamp_rel"], Value::from(2.0));
    }

    #[test]
    fn camera_archive_is_strict_about_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CAMERA_TEMPLATE), CAMERA).unwrap();
        let path = archive_path(dir.path(), "Basler");
        fs::write(&path, "keep me").unwrap();

        let cameras = [CameraSummary {
            id: 0,
            model: "Simulated".to_string(),
            serial_number: "SIM22000".to_string(),
            exposure_time: 5000.0,
            frame_rate: 2.0,
        }];
        let err = CameraArchive::create(dir.path(), &path, &cameras, None).err().unwrap();
        assert!(matches!(err, DaqError::OutputExists(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn camera_template_must_end_with_data() {
        assert!(check_camera_template(CAMERA).is_ok());
        assert!(check_camera_template("data: {}\ndefinitions: {}\n").is_err());
    }
}
