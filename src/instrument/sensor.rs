//! Recording shared by the scalar (sensor-style) devices.
//!
//! A sensor device declares a fixed channel table at construction. The
//! [`SensorRecorder`] owns everything downstream of `sample()`: the CSV log,
//! the in-memory history (`meas_data`) and the archive document.

use crate::data::{archive_path, MeasurementLog, SensorArchive};
use crate::error::{AppResult, DaqError};
use crate::hardware::{TcpTransport, TransportError};
use crate::measurement::{check_drift, MeasurementRecord, Readings, Sample, Timestamp, MISSING};
use std::path::{Path, PathBuf};

/// One scalar channel of a sensor device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Column and display name.
    pub name: &'static str,
    /// Unit written to the log's units row.
    pub unit: &'static str,
    /// Key of the value in a JSON response (TCP devices).
    pub key: &'static str,
}

impl Channel {
    /// Channel whose JSON key equals its name.
    pub const fn new(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit,
            key: name,
        }
    }

    /// Channel read from a differently named JSON key.
    pub const fn keyed(name: &'static str, unit: &'static str, key: &'static str) -> Self {
        Self { name, unit, key }
    }
}

struct SensorOutput {
    log: MeasurementLog,
    archive: SensorArchive,
}

/// Log, history and archive of one sensor device.
pub struct SensorRecorder {
    device: String,
    channels: &'static [Channel],
    comment: Option<String>,
    template_dir: PathBuf,
    meas_data: Vec<Vec<f64>>,
    output: Option<SensorOutput>,
}

impl SensorRecorder {
    /// Recorder for `device` with a fixed channel table.
    pub fn new(
        device: &str,
        channels: &'static [Channel],
        comment: Option<String>,
        template_dir: &Path,
    ) -> Self {
        Self {
            device: device.to_string(),
            channels,
            comment,
            template_dir: template_dir.to_path_buf(),
            meas_data: vec![Vec::new(); channels.len()],
            output: None,
        }
    }

    /// Channel table in column order.
    pub fn channels(&self) -> &'static [Channel] {
        self.channels
    }

    /// Channel names in column order.
    pub fn channel_names(&self) -> impl Iterator<Item = &'static str> {
        self.channels.iter().map(|channel| channel.name)
    }

    /// Readings with every channel missing.
    pub fn missing(&self) -> Readings {
        Readings::missing(self.channel_names())
    }

    /// History of one channel, in save order.
    pub fn history(&self, channel: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .position(|c| c.name == channel)
            .map(|idx| self.meas_data[idx].as_slice())
    }

    /// Number of samples saved.
    pub fn samples_saved(&self) -> usize {
        self.meas_data.first().map_or(0, Vec::len)
    }

    fn log_file_name(&self) -> String {
        format!("{}.csv", self.device)
    }

    /// Create `<directory>/<device>.csv` and the archive skeleton.
    ///
    /// Fails with [`DaqError::OutputExists`] if either file is already there.
    pub fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        if self.output.is_some() {
            return Err(DaqError::Configuration(format!(
                "{}: output already initialized",
                self.device
            )));
        }

        let archive_file = archive_path(directory, &self.device);
        if archive_file.exists() {
            return Err(DaqError::OutputExists(archive_file));
        }

        let archive = SensorArchive::load(&self.template_dir)?;
        let units: Vec<&str> = self.channels.iter().map(|c| c.unit).collect();
        let columns: Vec<&str> = self.channel_names().collect();
        let log = MeasurementLog::create(&directory.join(self.log_file_name()), &units, &columns)?;

        archive.write(
            &archive_file,
            &log.file_name(),
            self.channel_names(),
            self.comment.as_deref(),
        )?;

        tracing::info!(device = %self.device, path = %log.path().display(), "Measurement log initialized");
        self.output = Some(SensorOutput { log, archive });
        Ok(())
    }

    /// Append one sample to the log and the history.
    pub fn save(&mut self, time_abs: &Timestamp, time_rel: f64, sample: Sample) -> AppResult<()> {
        let readings = match sample {
            Sample::Readings(readings) => readings,
            other => {
                return Err(DaqError::Configuration(format!(
                    "{}: expected readings, got {}",
                    self.device,
                    other.kind()
                )))
            }
        };
        let output = self.output.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("{}: init_output has not been called", self.device))
        })?;

        check_drift(&self.device, time_abs, time_rel);

        let values: Vec<f64> = self
            .channels
            .iter()
            .map(|channel| readings.get(channel.name).unwrap_or(MISSING))
            .collect();
        output
            .log
            .append(&MeasurementRecord::from_values(*time_abs, time_rel, &values))?;

        for (history, value) in self.meas_data.iter_mut().zip(values) {
            history.push(value);
        }
        Ok(())
    }

    /// Compose the archive from the channels seen and overwrite it.
    pub fn write_archive(&self, directory: &Path) -> AppResult<()> {
        let loaded;
        let archive = match &self.output {
            Some(output) => &output.archive,
            None => {
                loaded = SensorArchive::load(&self.template_dir)?;
                &loaded
            }
        };
        archive.write(
            &archive_path(directory, &self.device),
            &self.log_file_name(),
            self.channel_names(),
            self.comment.as_deref(),
        )
    }
}

/// One TCP exchange mapped onto a channel table.
///
/// Any failure marks every channel missing and is logged.
pub async fn sample_tcp(
    device: &str,
    transport: &mut TcpTransport,
    channels: &[Channel],
) -> Readings {
    let keys: Vec<&str> = channels.iter().map(|c| c.key).collect();
    match transport.request_fields(&keys).await {
        Ok(values) => channels
            .iter()
            .zip(values)
            .map(|(channel, value)| (channel.name, value))
            .collect(),
        Err(err) => {
            log_read_failure(device, None, &err);
            Readings::missing(channels.iter().map(|c| c.name))
        }
    }
}

/// Log a failed read at a severity matching its cause.
pub fn log_read_failure(device: &str, channel: Option<&str>, err: &TransportError) {
    match err {
        // Reported once at construction; repeated per sample at debug only.
        TransportError::NotConnected(state) => {
            tracing::debug!(device, channel, %state, "Could not sample {device}: not connected");
        }
        _ => {
            tracing::error!(device, channel, error = %err, "Could not sample {device}");
        }
    }
}
