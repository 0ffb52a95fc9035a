//! Array of industrial cameras driven through one SDK session.
//!
//! Construction attaches exactly one physical camera per configured unit and
//! tags it with a context id equal to its position in the configuration. Each
//! `sample()` retrieves one frame per unit; a unit that fails only marks its
//! own slot as failed.
//!
//! Output layout under the measurement directory:
//!
//! ```text
//! <name>/_images.csv           one filename column per unit
//! <name>/device.txt            attached units
//! <name>/img_000001.jpg        single unit
//! <name>/img_000001_cam1.jpg   arrays
//! <name>.archive.yaml          grown by one images_list entry per image
//! ```

use super::Instrument;
use crate::config::CameraUnitConfig;
use crate::data::{archive_path, CameraArchive, CameraSummary, ImageEntry, MeasurementLog};
use crate::error::{AppResult, DaqError};
use crate::hardware::camera::to_rgb8;
use crate::hardware::{CameraBackend, CameraInfo, CameraSdk};
use crate::measurement::{check_drift, format_timestamp, MeasurementRecord, Sample, Timestamp, UnitFrame};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Slack on top of a unit's timeout before the retrieve call is abandoned.
const RETRIEVE_GRACE: Duration = Duration::from_millis(50);

struct AttachedUnit {
    context_id: usize,
    info: CameraInfo,
    config: CameraUnitConfig,
}

struct CameraOutput {
    directory: PathBuf,
    log: MeasurementLog,
    archive: CameraArchive,
}

/// Camera array device.
pub struct CameraArrayDevice {
    name: String,
    units: Vec<AttachedUnit>,
    backend: Option<Box<dyn CameraBackend>>,
    comment: Option<String>,
    template_dir: PathBuf,
    output: Option<CameraOutput>,
    image_counter: u64,
}

impl CameraArrayDevice {
    /// Open an SDK session, attach one camera per configured unit and start grabbing.
    ///
    /// Fails with [`DaqError::Connection`] when fewer cameras are attached
    /// than configured.
    pub fn connect(
        name: &str,
        units: &[CameraUnitConfig],
        sdk: &dyn CameraSdk,
        template_dir: &Path,
    ) -> AppResult<Self> {
        if units.is_empty() {
            return Err(DaqError::Configuration(format!(
                "{name}: camera list must not be empty"
            )));
        }

        let mut backend = sdk.open().map_err(|e| DaqError::Connection {
            device: name.to_string(),
            reason: e.to_string(),
        })?;

        let available = backend.enumerate()?;
        if available.len() < units.len() {
            return Err(DaqError::Connection {
                device: name.to_string(),
                reason: format!(
                    "{} cameras configured but only {} found",
                    units.len(),
                    available.len()
                ),
            });
        }

        let mut attached = Vec::with_capacity(units.len());
        for (context_id, config) in units.iter().enumerate() {
            let info = backend.attach(context_id, context_id)?;
            backend.set_exposure_time(context_id, config.exposure_time)?;
            backend.set_frame_rate(context_id, config.frame_rate)?;
            tracing::info!(
                device = name,
                context_id,
                model = %info.model,
                serial = %info.serial_number,
                exposure_us = config.exposure_time,
                frame_rate_hz = config.frame_rate,
                "Camera attached"
            );
            attached.push(AttachedUnit {
                context_id,
                info,
                config: config.clone(),
            });
        }
        backend.start_grabbing()?;

        Ok(Self {
            name: name.to_string(),
            units: attached,
            backend: Some(backend),
            comment: units.iter().find_map(|unit| unit.comment.clone()),
            template_dir: template_dir.to_path_buf(),
            output: None,
            image_counter: 1,
        })
    }

    /// Context ids of the attached units, in configuration order.
    pub fn unit_ids(&self) -> Vec<usize> {
        self.units.iter().map(|unit| unit.context_id).collect()
    }

    /// Identity of the attached units, in configuration order.
    pub fn unit_info(&self) -> impl Iterator<Item = (usize, &CameraInfo)> {
        self.units.iter().map(|unit| (unit.context_id, &unit.info))
    }

    /// Counter used for the next image name.
    pub fn image_counter(&self) -> u64 {
        self.image_counter
    }

    fn image_name(&self, context_id: usize) -> String {
        if self.units.len() == 1 {
            format!("img_{:06}.jpg", self.image_counter)
        } else {
            format!("img_{:06}_cam{context_id}.jpg", self.image_counter)
        }
    }

    fn column_names(&self) -> Vec<String> {
        if self.units.len() == 1 {
            vec!["img-name".to_string()]
        } else {
            self.units
                .iter()
                .map(|unit| format!("img-name_cam{}", unit.context_id))
                .collect()
        }
    }

    fn device_listing(&self) -> String {
        let mut listing = String::new();
        for unit in &self.units {
            let _ = writeln!(
                listing,
                "cam{}: {} (serial {}, {})",
                unit.context_id, unit.info.model, unit.info.serial_number, unit.info.device_class
            );
        }
        listing
    }
}

#[async_trait]
impl Instrument for CameraArrayDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "camera-array"
    }

    fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        if self.output.is_some() {
            return Err(DaqError::Configuration(format!(
                "{}: output already initialized",
                self.name
            )));
        }

        let image_dir = directory.join(&self.name);
        fs::create_dir(&image_dir).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => DaqError::OutputExists(image_dir.clone()),
            _ => DaqError::Io(e),
        })?;

        let columns = self.column_names();
        let units = vec!["filename".to_string(); columns.len()];
        let log = MeasurementLog::create(&image_dir.join("_images.csv"), &units, &columns)?;
        fs::write(image_dir.join("device.txt"), self.device_listing())?;

        let cameras: Vec<CameraSummary> = self
            .units
            .iter()
            .map(|unit| CameraSummary {
                id: unit.context_id,
                model: unit.info.model.clone(),
                serial_number: unit.info.serial_number.clone(),
                exposure_time: unit.config.exposure_time,
                frame_rate: unit.config.frame_rate,
            })
            .collect();
        let archive = CameraArchive::create(
            &self.template_dir,
            &archive_path(directory, &self.name),
            &cameras,
            self.comment.as_deref(),
        )?;

        tracing::info!(device = %self.name, path = %image_dir.display(), "Image output initialized");
        self.output = Some(CameraOutput {
            directory: image_dir,
            log,
            archive,
        });
        Ok(())
    }

    async fn sample(&mut self) -> AppResult<Sample> {
        let backend = self.backend.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("{}: sampled after shutdown", self.name))
        })?;

        let mut frames = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let timeout = unit.config.retrieve_timeout();
            let retrieved =
                match tokio::time::timeout(timeout + RETRIEVE_GRACE, backend.retrieve(unit.context_id, timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DaqError::Acquisition {
                        unit: unit.context_id,
                        reason: format!("no frame within {} ms", timeout.as_millis()),
                    }),
                };
            let frame = retrieved.and_then(|raw| to_rgb8(&raw));
            if let Err(err) = &frame {
                tracing::warn!(device = %self.name, unit = unit.context_id, error = %err, "Image grabbing failed");
            }
            frames.push(UnitFrame {
                unit_id: unit.context_id,
                frame,
            });
        }
        Ok(Sample::Frames(frames))
    }

    fn save_measurement(&mut self, time_abs: &Timestamp, time_rel: f64, sample: Sample) -> AppResult<()> {
        let frames = match sample {
            Sample::Frames(frames) => frames,
            other => {
                return Err(DaqError::Configuration(format!(
                    "{}: expected frames, got {}",
                    self.name,
                    other.kind()
                )))
            }
        };
        if frames.len() != self.units.len() {
            return Err(DaqError::Configuration(format!(
                "{}: {} frames for {} units",
                self.name,
                frames.len(),
                self.units.len()
            )));
        }
        if self.output.is_none() {
            return Err(DaqError::Configuration(format!(
                "{}: init_output has not been called",
                self.name
            )));
        }

        check_drift(&self.name, time_abs, time_rel);
        let timestamp_abs = format_timestamp(time_abs);

        let names: Vec<String> = frames
            .iter()
            .map(|frame| self.image_name(frame.unit_id))
            .collect();
        // The counter is spent once the sample is accepted, so a failed write
        // never leads the next sample to reuse these names.
        self.image_counter += 1;
        let output = self.output.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("{}: init_output has not been called", self.name))
        })?;

        // Images first: a unit whose image cannot be written counts as failed,
        // so the log row and the archive list the same files.
        let mut fields = Vec::with_capacity(frames.len());
        let mut saved = Vec::with_capacity(frames.len());
        for (frame, name) in frames.into_iter().zip(names) {
            let Ok(image) = frame.frame else {
                fields.push(String::new());
                continue;
            };
            match image.save_with_format(output.directory.join(&name), image::ImageFormat::Jpeg) {
                Ok(()) => {
                    saved.push((frame.unit_id, name.clone()));
                    fields.push(name);
                }
                Err(err) => {
                    tracing::error!(device = %self.name, unit = frame.unit_id, image = %name, error = %err, "Could not save image");
                    fields.push(String::new());
                }
            }
        }

        output
            .log
            .append(&MeasurementRecord::new(*time_abs, time_rel, fields))?;

        for (unit_id, name) in saved {
            output.archive.append_image(&ImageEntry {
                image: format!("{}/{name}", self.name),
                name,
                camera: unit_id,
                timestamp_rel: time_rel,
                timestamp_abs: timestamp_abs.clone(),
            })?;
        }
        Ok(())
    }

    fn write_archive_fragment(&mut self, _directory: &Path) -> AppResult<()> {
        // Entries were appended per sample.
        if let Some(output) = &self.output {
            tracing::debug!(
                device = %self.name,
                entries = output.archive.entries(),
                path = %output.archive.path().display(),
                "Camera archive complete"
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.close()?;
            tracing::info!(device = %self.name, "Camera grabbing stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedCameraSdk;
    use crate::test_support::write_templates;

    fn unit(exposure: f64) -> CameraUnitConfig {
        CameraUnitConfig {
            exposure_time: exposure,
            frame_rate: 2.0,
            timeout: 50,
            comment: None,
        }
    }

    #[test]
    fn attaches_exactly_the_configured_units() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = SimulatedCameraSdk::new(4);
        let device =
            CameraArrayDevice::connect("Basler", &[unit(5000.0), unit(8000.0)], &sdk, dir.path())
                .unwrap();
        assert_eq!(device.unit_ids(), [0, 1]);
    }

    #[test]
    fn too_few_cameras_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = SimulatedCameraSdk::new(1);
        let err = CameraArrayDevice::connect("Basler", &[unit(5000.0), unit(8000.0)], &sdk, dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn image_names_depend_on_array_size() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = SimulatedCameraSdk::new(2);
        let single = CameraArrayDevice::connect("Basler", &[unit(5000.0)], &sdk, dir.path()).unwrap();
        assert_eq!(single.image_name(0), "img_000001.jpg");

        let array =
            CameraArrayDevice::connect("Basler", &[unit(5000.0), unit(5000.0)], &sdk, dir.path())
                .unwrap();
        assert_eq!(array.image_name(1), "img_000001_cam1.jpg");
    }

    #[tokio::test]
    async fn init_output_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        write_templates(dir.path());
        let sdk = SimulatedCameraSdk::new(1);
        let mut device = CameraArrayDevice::connect("Basler", &[unit(5000.0)], &sdk, dir.path()).unwrap();

        fs::create_dir(dir.path().join("Basler")).unwrap();
        assert!(matches!(
            device.init_output(dir.path()),
            Err(DaqError::OutputExists(_))
        ));
    }

    #[tokio::test]
    async fn sample_after_shutdown_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let sdk = SimulatedCameraSdk::new(1);
        let mut device = CameraArrayDevice::connect("Basler", &[unit(5000.0)], &sdk, dir.path()).unwrap();
        device.shutdown().await.unwrap();
        device.shutdown().await.unwrap();
        assert!(matches!(device.sample().await, Err(DaqError::Configuration(_))));
    }
}
