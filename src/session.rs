//! Fixed-cadence acquisition around the device contract.
//!
//! An [`AcquisitionSession`] owns the connected devices and one measurement
//! directory, `<output_dir>/measdata_<YYYY-MM-DD_HH-MM-SS>/`. Each tick takes
//! one timestamp pair and runs `sample` + `save_measurement` for every device
//! in turn. When the run ends (duration reached or stop signal) every device's
//! archive is finalized and its transport released, even if earlier steps
//! failed.

use crate::config::{DeviceConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::instrument::{connect_device, Device, DeviceContext, Instrument};
use crate::measurement::{now, Timestamp};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Measurement directory of the run.
    pub directory: PathBuf,
    /// Number of ticks executed.
    pub ticks: u64,
    /// Names of the devices that took part.
    pub devices: Vec<String>,
}

/// Connect every configured device.
///
/// Devices failing with a recoverable error are logged and left out; any
/// other error aborts. At least one device must remain.
pub async fn connect_devices(
    configs: &[(String, DeviceConfig)],
    context: &DeviceContext,
) -> AppResult<Vec<Device>> {
    let mut devices = Vec::with_capacity(configs.len());
    for (name, config) in configs {
        match connect_device(name, config, context).await {
            Ok(device) => devices.push(device),
            Err(err) if err.is_recoverable() => {
                error!(device = %name, error = %err, "Device '{name}' skipped");
            }
            Err(err) => return Err(err),
        }
    }
    if devices.is_empty() {
        return Err(DaqError::Configuration(
            "no configured device could be connected".to_string(),
        ));
    }
    Ok(devices)
}

/// Create `<output_dir>/measdata_<timestamp>/`, failing if it already exists.
pub fn create_measurement_dir(output_dir: &Path, started: &Timestamp) -> AppResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let directory = output_dir.join(format!(
        "measdata_{}",
        started.format("%Y-%m-%d_%H-%M-%S")
    ));
    std::fs::create_dir(&directory).map_err(|e| match e.kind() {
        ErrorKind::AlreadyExists => DaqError::OutputExists(directory.clone()),
        _ => DaqError::Io(e),
    })?;
    Ok(directory)
}

/// A run over a fixed set of devices.
pub struct AcquisitionSession {
    devices: Vec<Device>,
    directory: PathBuf,
    interval: Duration,
    duration: Option<Duration>,
}

impl AcquisitionSession {
    /// Connect the configured devices and prepare their outputs.
    pub async fn from_settings(settings: &Settings) -> AppResult<Self> {
        let configs = settings.device_configs()?;
        let context = DeviceContext::for_backend(
            settings.acquisition.template_dir.clone(),
            settings.acquisition.camera_backend,
            &configs,
        );
        let devices = connect_devices(&configs, &context).await?;
        Self::new(
            devices,
            &settings.acquisition.output_dir,
            settings.acquisition.sampling_interval()?,
            settings.acquisition.run_duration()?,
        )
    }

    /// Create the measurement directory and call `init_output` on every device.
    pub fn new(
        devices: Vec<Device>,
        output_dir: &Path,
        interval: Duration,
        duration: Option<Duration>,
    ) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(DaqError::Configuration(
                "sampling interval must be positive".to_string(),
            ));
        }
        let directory = create_measurement_dir(output_dir, &now())?;
        let mut session = Self {
            devices,
            directory,
            interval,
            duration,
        };
        for device in &mut session.devices {
            device.init_output(&session.directory)?;
        }
        info!(
            directory = %session.directory.display(),
            devices = session.devices.len(),
            "Measurement directory prepared"
        );
        Ok(session)
    }

    /// Measurement directory of this run.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Devices taking part, in sampling order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Sample until the duration elapses or `stop` completes, then finalize.
    pub async fn run<F>(mut self, stop: F) -> AppResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let outcome = self.acquire(stop).await;
        let finalized = self.finalize().await;

        match (outcome, finalized) {
            (Ok(ticks), Ok(())) => Ok(RunSummary {
                directory: self.directory.clone(),
                ticks,
                devices: self.devices.iter().map(|d| d.name().to_string()).collect(),
            }),
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Err(shutdown)) => {
                error!(error = %shutdown, "Finalization failed after acquisition error");
                Err(err)
            }
        }
    }

    async fn acquire<F>(&mut self, stop: F) -> AppResult<u64>
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        // A duration past the clock's range means no deadline.
        let deadline = self.duration.and_then(|duration| start.checked_add(duration));
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(stop, expired);

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Stop requested");
                    break;
                }
                _ = &mut expired => {
                    info!("Acquisition duration reached");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let time_abs = now();
            let time_rel = round_millis(start.elapsed());
            self.tick(&time_abs, time_rel).await?;
            ticks += 1;
        }
        Ok(ticks)
    }

    async fn tick(&mut self, time_abs: &Timestamp, time_rel: f64) -> AppResult<()> {
        for device in &mut self.devices {
            let sample = match device.sample().await {
                Ok(sample) => sample,
                Err(err) if err.is_recoverable() => {
                    warn!(device = %device.name(), error = %err, "Sample dropped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            device.save_measurement(time_abs, time_rel, sample)?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for device in &mut self.devices {
            if let Err(err) = device.write_archive_fragment(&self.directory) {
                error!(device = %device.name(), error = %err, "Archive finalization failed");
                errors.push(err);
            }
            if let Err(err) = device.shutdown().await {
                error!(device = %device.name(), error = %err, "Shutdown failed");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            info!(directory = %self.directory.display(), "Acquisition finished");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

/// Seconds with millisecond resolution.
fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn relative_time_is_rounded_to_millis() {
        assert_eq!(round_millis(Duration::from_micros(1_234_567)), 1.235);
        assert_eq!(round_millis(Duration::ZERO), 0.0);
    }

    #[test]
    fn measurement_dir_is_named_after_start_and_strict() {
        let root = tempfile::tempdir().unwrap();
        let started = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 8, 5, 9)
            .unwrap();

        let dir = create_measurement_dir(&root.path().join("data"), &started).unwrap();
        assert!(dir.ends_with("measdata_2024-03-01_08-05-09"));
        assert!(dir.is_dir());

        assert!(matches!(
            create_measurement_dir(&root.path().join("data"), &started),
            Err(DaqError::OutputExists(_))
        ));
    }

    #[tokio::test]
    async fn nothing_connectable_is_an_error() {
        let configs = vec![(
            "Basler".to_string(),
            DeviceConfig::CameraArray(vec![crate::config::CameraUnitConfig {
                exposure_time: 1000.0,
                frame_rate: 1.0,
                timeout: 100,
                comment: None,
            }]),
        )];
        let err = connect_devices(&configs, &DeviceContext::new("templates"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}
