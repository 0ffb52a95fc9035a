//! The device contract and its variants.
//!
//! Every device obeys the same lifecycle:
//!
//! ```text
//! connect → init_output → (sample → save_measurement)* → write_archive_fragment → shutdown
//! ```
//!
//! [`Device`] is the closed set of supported variants; [`connect_device`]
//! selects one from the shape of its configuration.

pub mod camera_array;
pub mod controller;
pub mod generator;
pub mod sensor;

pub use camera_array::CameraArrayDevice;
pub use controller::{SerialControllerDevice, TcpControllerDevice};
pub use generator::TcpGeneratorDevice;

use crate::config::{CameraBackendKind, DeviceConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::{CameraSdk, SimulatedCameraSdk};
use crate::measurement::{Sample, Timestamp};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Contract shared by all devices.
///
/// `sample` and `save_measurement` are called sequentially by a single
/// scheduler; the device owns its transport, log and history exclusively.
#[async_trait]
pub trait Instrument: Send {
    /// Configured device name.
    fn name(&self) -> &str;

    /// Variant label.
    fn kind(&self) -> &'static str;

    /// Create the output location, the log header and the archive skeleton.
    ///
    /// Fails with [`DaqError::OutputExists`] when the location already exists.
    fn init_output(&mut self, directory: &Path) -> AppResult<()>;

    /// One read cycle.
    ///
    /// Transport failures never surface here: affected channels carry the
    /// missing-value sentinel instead. An error means misuse or misconfiguration.
    async fn sample(&mut self) -> AppResult<Sample>;

    /// Persist one sample taken at `time_abs`, `time_rel` seconds into the run.
    fn save_measurement(&mut self, time_abs: &Timestamp, time_rel: f64, sample: Sample) -> AppResult<()>;

    /// Finalize the archive document in `directory`.
    fn write_archive_fragment(&mut self, directory: &Path) -> AppResult<()>;

    /// Release the transport. Idempotent, and valid after a failed sample.
    async fn shutdown(&mut self) -> AppResult<()>;
}

/// A configured device, tagged by variant.
pub enum Device {
    /// Camera array
    CameraArray(CameraArrayDevice),
    /// Temperature controller on a serial line
    SerialController(SerialControllerDevice),
    /// Temperature controller behind the TCP bridge
    TcpController(TcpControllerDevice),
    /// Generator behind the TCP bridge
    Generator(TcpGeneratorDevice),
}

macro_rules! delegate {
    ($self:ident, $device:ident => $body:expr) => {
        match $self {
            Device::CameraArray($device) => $body,
            Device::SerialController($device) => $body,
            Device::TcpController($device) => $body,
            Device::Generator($device) => $body,
        }
    };
}

#[async_trait]
impl Instrument for Device {
    fn name(&self) -> &str {
        delegate!(self, device => device.name())
    }

    fn kind(&self) -> &'static str {
        delegate!(self, device => device.kind())
    }

    fn init_output(&mut self, directory: &Path) -> AppResult<()> {
        delegate!(self, device => device.init_output(directory))
    }

    async fn sample(&mut self) -> AppResult<Sample> {
        delegate!(self, device => device.sample().await)
    }

    fn save_measurement(&mut self, time_abs: &Timestamp, time_rel: f64, sample: Sample) -> AppResult<()> {
        delegate!(self, device => device.save_measurement(time_abs, time_rel, sample))
    }

    fn write_archive_fragment(&mut self, directory: &Path) -> AppResult<()> {
        delegate!(self, device => device.write_archive_fragment(directory))
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        delegate!(self, device => device.shutdown().await)
    }
}

/// Shared resources handed to every device at construction.
#[derive(Clone)]
pub struct DeviceContext {
    /// Directory holding the archive templates.
    pub template_dir: PathBuf,
    /// Camera SDK, if one is available.
    pub camera_sdk: Option<Arc<dyn CameraSdk>>,
}

impl DeviceContext {
    /// Context without a camera SDK.
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            camera_sdk: None,
        }
    }

    /// Use `sdk` for camera arrays.
    pub fn with_camera_sdk(mut self, sdk: Arc<dyn CameraSdk>) -> Self {
        self.camera_sdk = Some(sdk);
        self
    }

    /// Context for the configured camera backend.
    ///
    /// The simulated backend enumerates as many cameras as the largest
    /// configured array needs.
    pub fn for_backend(
        template_dir: impl Into<PathBuf>,
        backend: CameraBackendKind,
        devices: &[(String, DeviceConfig)],
    ) -> Self {
        let context = Self::new(template_dir);
        match backend {
            CameraBackendKind::None => context,
            CameraBackendKind::Simulated => {
                let cameras = devices
                    .iter()
                    .filter_map(|(_, config)| match config {
                        DeviceConfig::CameraArray(units) => Some(units.len()),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0);
                context.with_camera_sdk(Arc::new(SimulatedCameraSdk::new(cameras)))
            }
        }
    }
}

/// Build the device variant matching `config`.
///
/// Sensor devices always construct: an unavailable transport leaves them
/// sampling missing values. A camera array fails with
/// [`DaqError::Connection`] when its units cannot be attached.
pub async fn connect_device(
    name: &str,
    config: &DeviceConfig,
    context: &DeviceContext,
) -> AppResult<Device> {
    let template_dir = context.template_dir.as_path();
    let device = match config {
        DeviceConfig::CameraArray(units) => {
            let sdk = context.camera_sdk.as_ref().ok_or_else(|| DaqError::Connection {
                device: name.to_string(),
                reason: "no camera SDK available".to_string(),
            })?;
            Device::CameraArray(CameraArrayDevice::connect(name, units, sdk.as_ref(), template_dir)?)
        }
        DeviceConfig::SerialController {
            interface,
            address,
            comment,
        } => Device::SerialController(
            SerialControllerDevice::connect(name, interface, address, comment.clone(), template_dir)
                .await,
        ),
        DeviceConfig::TcpController { interface, comment } => Device::TcpController(
            TcpControllerDevice::connect(name, interface, comment.clone(), template_dir).await,
        ),
        DeviceConfig::Generator(generator) => Device::Generator(
            TcpGeneratorDevice::connect(name, generator, template_dir).await,
        ),
    };
    tracing::debug!(device = name, kind = device.kind(), "Device constructed");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraUnitConfig, GeneratorConfig};
    use crate::hardware::TransportState;
    use tokio::net::TcpListener;

    fn camera_config(units: usize) -> DeviceConfig {
        DeviceConfig::CameraArray(
            (0..units)
                .map(|_| CameraUnitConfig {
                    exposure_time: 5000.0,
                    frame_rate: 2.0,
                    timeout: 100,
                    comment: None,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn camera_without_sdk_is_a_connection_error() {
        let context = DeviceContext::new("templates");
        let err = connect_device("Basler", &camera_config(1), &context).await.err().unwrap();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    #[tokio::test]
    async fn simulated_backend_covers_largest_array() {
        let devices = vec![
            ("A".to_string(), camera_config(1)),
            ("B".to_string(), camera_config(3)),
        ];
        let context = DeviceContext::for_backend("templates", CameraBackendKind::Simulated, &devices);
        for (name, config) in &devices {
            let device = connect_device(name, config, &context).await.unwrap();
            assert_eq!(device.kind(), "camera-array");
        }
    }

    #[tokio::test]
    async fn unreachable_generator_still_constructs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = DeviceConfig::Generator(GeneratorConfig {
            ip: "127.0.0.1".to_string(),
            port,
            timeout: 0.2,
            comment: None,
        });
        let device = connect_device("vifcon", &config, &DeviceContext::new("templates"))
            .await
            .unwrap();
        match device {
            Device::Generator(generator) => {
                assert_eq!(generator.transport_state(), TransportState::Disconnected)
            }
            _ => panic!("expected a generator"),
        }
    }
}
