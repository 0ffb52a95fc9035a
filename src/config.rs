//! Configuration system using Figment.
//!
//! Configuration is loaded from:
//! 1. A YAML (`.yml`/`.yaml`) or TOML file (base configuration)
//! 2. Environment variables (prefixed with `MULTILOG_`, nested keys split on `__`)
//!
//! Device entries are kept as loosely shaped values until
//! [`DeviceConfig::from_value`] classifies them by shape and deserializes
//! them into one strictly typed struct per device variant.
//!
//! # Example
//! ```no_run
//! use multilog::config::Settings;
//!
//! let settings = Settings::load_from("config/multilog.yml")?;
//! settings.validate()?;
//! for (name, device) in settings.device_configs()? {
//!     println!("{name}: {}", device.kind());
//! }
//! # Ok::<(), multilog::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Acquisition loop and output settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Device definitions, keyed by device name
    pub devices: BTreeMap<String, Value>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Which camera SDK backs camera-array devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    /// No SDK available; camera devices fail construction.
    #[default]
    None,
    /// Deterministic simulated cameras.
    Simulated,
}

/// Acquisition loop and output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Parent directory of the per-run measurement directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seconds between sampling ticks
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Run length in seconds (runs until interrupted when absent)
    #[serde(default)]
    pub duration: Option<f64>,
    /// Directory holding the archive templates
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Camera SDK used for camera-array devices
    #[serde(default)]
    pub camera_backend: CameraBackendKind,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            interval: default_interval(),
            duration: None,
            template_dir: default_template_dir(),
            camera_backend: CameraBackendKind::None,
        }
    }
}

impl AcquisitionConfig {
    /// `interval` as a duration, at most [`MAX_INTERVAL_S`].
    pub fn sampling_interval(&self) -> AppResult<Duration> {
        if self.interval > MAX_INTERVAL_S {
            return Err(DaqError::Configuration(format!(
                "Invalid interval {}. Must not exceed {MAX_INTERVAL_S} seconds",
                self.interval
            )));
        }
        positive_duration("interval", self.interval)
    }

    /// `duration` as a duration, `None` when the run is open-ended.
    pub fn run_duration(&self) -> AppResult<Option<Duration>> {
        self.duration
            .map(|duration| positive_duration("duration", duration))
            .transpose()
    }
}

// Default value functions
fn default_name() -> String {
    "multilog".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_interval() -> f64 {
    1.0
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("./templates")
}

impl Settings {
    /// Load configuration from a file and `MULTILOG_` environment variables.
    ///
    /// Files ending in `.yml`/`.yaml` are read as YAML, everything else as TOML.
    /// Example override: `MULTILOG_ACQUISITION__INTERVAL=0.5`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yml" | "yaml")
        );
        let figment = if is_yaml {
            Figment::new().merge(Yaml::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let settings = figment
            .merge(Env::prefixed("MULTILOG_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        self.acquisition.sampling_interval()?;
        self.acquisition.run_duration()?;

        if self.devices.is_empty() {
            return Err(DaqError::Configuration("No devices configured".to_string()));
        }

        self.device_configs().map(|_| ())
    }

    /// Classify and type every configured device, in name order.
    pub fn device_configs(&self) -> AppResult<Vec<(String, DeviceConfig)>> {
        self.devices
            .iter()
            .map(|(name, value)| Ok((name.clone(), DeviceConfig::from_value(name, value)?)))
            .collect()
    }
}

// =============================================================================
// Device configuration
// =============================================================================

/// One physical camera of a camera array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CameraUnitConfig {
    /// Exposure time in microseconds
    pub exposure_time: f64,
    /// Acquisition frame rate in Hz
    pub frame_rate: f64,
    /// Frame retrieval timeout in milliseconds
    #[serde(default = "default_camera_timeout_ms")]
    pub timeout: u64,
    /// Free-text comment copied into the archive
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_camera_timeout_ms() -> u64 {
    1000
}

impl CameraUnitConfig {
    /// Retrieval timeout as a duration.
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    /// No parity
    #[default]
    #[serde(rename = "N")]
    None,
    /// Even parity
    #[serde(rename = "E")]
    Even,
    /// Odd parity
    #[serde(rename = "O")]
    Odd,
}

/// Serial line parameters (pyserial-compatible key names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialInterfaceConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Data bits (7 or 8)
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// Parity (N, E, O)
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    /// Read timeout in seconds
    #[serde(default = "default_serial_timeout")]
    pub timeout: f64,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_bytesize() -> u8 {
    8
}

fn default_stopbits() -> u8 {
    1
}

fn default_serial_timeout() -> f64 {
    0.1
}

impl SerialInterfaceConfig {
    /// Read timeout as a duration.
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }

    fn validate(&self, device: &str) -> AppResult<()> {
        if self.port.trim().is_empty() {
            return Err(DaqError::Configuration(format!(
                "{device}: serial-interface.port must not be empty"
            )));
        }
        if !matches!(self.bytesize, 7 | 8) {
            return Err(DaqError::Configuration(format!(
                "{device}: serial-interface.bytesize must be 7 or 8, got {}",
                self.bytesize
            )));
        }
        if !matches!(self.stopbits, 1 | 2) {
            return Err(DaqError::Configuration(format!(
                "{device}: serial-interface.stopbits must be 1 or 2, got {}",
                self.stopbits
            )));
        }
        validate_timeout(device, "serial-interface.timeout", self.timeout)
    }

    /// Data bits for the serial port builder.
    #[cfg(feature = "instrument_serial")]
    pub fn data_bits(&self) -> tokio_serial::DataBits {
        match self.bytesize {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    /// Parity for the serial port builder.
    #[cfg(feature = "instrument_serial")]
    pub fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }

    /// Stop bits for the serial port builder.
    #[cfg(feature = "instrument_serial")]
    pub fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stopbits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// TCP endpoint of the VIFCON bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpInterfaceConfig {
    /// Host address
    #[serde(rename = "IP")]
    pub ip: String,
    /// TCP port
    #[serde(rename = "Port")]
    pub port: u16,
    /// Connect and exchange timeout in seconds
    #[serde(default = "default_tcp_timeout")]
    pub timeout: f64,
}

fn default_tcp_timeout() -> f64 {
    1.0
}

impl TcpInterfaceConfig {
    /// Exchange timeout as a duration.
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }

    fn validate(&self, device: &str) -> AppResult<()> {
        if self.ip.trim().is_empty() {
            return Err(DaqError::Configuration(format!("{device}: IP must not be empty")));
        }
        validate_timeout(device, "timeout", self.timeout)
    }
}

/// Temperature controller, reachable over exactly one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Serial line parameters
    #[serde(default)]
    pub serial_interface: Option<SerialInterfaceConfig>,
    /// TCP endpoint
    #[serde(default)]
    pub tcp_interface: Option<TcpInterfaceConfig>,
    /// 4-digit channel code of the serial protocol
    #[serde(default = "default_address")]
    pub address: String,
    /// Free-text comment copied into the archive
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_address() -> String {
    "0000".to_string()
}

/// Power-supply-like generator behind the VIFCON bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Host address
    #[serde(rename = "IP")]
    pub ip: String,
    /// TCP port
    #[serde(rename = "Port")]
    pub port: u16,
    /// Connect and exchange timeout in seconds
    #[serde(default = "default_tcp_timeout")]
    pub timeout: f64,
    /// Free-text comment copied into the archive
    #[serde(default)]
    pub comment: Option<String>,
}

impl GeneratorConfig {
    /// The generator's endpoint as an interface config.
    pub fn interface(&self) -> TcpInterfaceConfig {
        TcpInterfaceConfig {
            ip: self.ip.clone(),
            port: self.port,
            timeout: self.timeout,
        }
    }
}

/// Validated configuration of one device, by variant.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceConfig {
    /// Camera array, one entry per physical camera (never empty)
    CameraArray(Vec<CameraUnitConfig>),
    /// Temperature controller on a serial line
    SerialController {
        /// Serial line parameters
        interface: SerialInterfaceConfig,
        /// 4-digit channel code
        address: String,
        /// Free-text comment
        comment: Option<String>,
    },
    /// Temperature controller behind the TCP bridge
    TcpController {
        /// TCP endpoint
        interface: TcpInterfaceConfig,
        /// Free-text comment
        comment: Option<String>,
    },
    /// Generator behind the TCP bridge
    Generator(GeneratorConfig),
}

impl DeviceConfig {
    /// Classify a raw device entry by its shape and deserialize it.
    ///
    /// - sequence, or mapping with `exposure-time` → camera array
    /// - mapping with `serial-interface` → serial controller
    /// - mapping with `tcp-interface` → TCP controller
    /// - mapping with `IP` and `Port` → generator
    pub fn from_value(name: &str, value: &Value) -> AppResult<Self> {
        let typed = |err: serde_json::Error| {
            DaqError::Configuration(format!("{name}: {err}"))
        };

        match value {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return Err(DaqError::Configuration(format!(
                        "{name}: camera list must not be empty"
                    )));
                }
                let units: Vec<CameraUnitConfig> = entries
                    .iter()
                    .map(|entry| serde_json::from_value(entry.clone()).map_err(typed))
                    .collect::<AppResult<_>>()?;
                Self::validate_cameras(name, &units)?;
                Ok(DeviceConfig::CameraArray(units))
            }
            Value::Object(map) if map.contains_key("exposure-time") => {
                let unit: CameraUnitConfig =
                    serde_json::from_value(value.clone()).map_err(typed)?;
                let units = vec![unit];
                Self::validate_cameras(name, &units)?;
                Ok(DeviceConfig::CameraArray(units))
            }
            Value::Object(map)
                if map.contains_key("serial-interface") || map.contains_key("tcp-interface") =>
            {
                let controller: ControllerConfig =
                    serde_json::from_value(value.clone()).map_err(typed)?;
                match (controller.serial_interface, controller.tcp_interface) {
                    (Some(interface), None) => {
                        interface.validate(name)?;
                        validate_address(name, &controller.address)?;
                        Ok(DeviceConfig::SerialController {
                            interface,
                            address: controller.address,
                            comment: controller.comment,
                        })
                    }
                    (None, Some(interface)) => {
                        interface.validate(name)?;
                        Ok(DeviceConfig::TcpController {
                            interface,
                            comment: controller.comment,
                        })
                    }
                    _ => Err(DaqError::Configuration(format!(
                        "{name}: exactly one of serial-interface and tcp-interface must be configured"
                    ))),
                }
            }
            Value::Object(map) if map.contains_key("IP") && map.contains_key("Port") => {
                let generator: GeneratorConfig =
                    serde_json::from_value(value.clone()).map_err(typed)?;
                generator.interface().validate(name)?;
                Ok(DeviceConfig::Generator(generator))
            }
            _ => Err(DaqError::Configuration(format!(
                "{name}: unsupported device configuration (expected a camera list, serial-interface, tcp-interface, or IP/Port)"
            ))),
        }
    }

    /// Short variant label.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceConfig::CameraArray(_) => "camera-array",
            DeviceConfig::SerialController { .. } => "serial-controller",
            DeviceConfig::TcpController { .. } => "tcp-controller",
            DeviceConfig::Generator(_) => "generator",
        }
    }

    fn validate_cameras(name: &str, units: &[CameraUnitConfig]) -> AppResult<()> {
        for (idx, unit) in units.iter().enumerate() {
            if !(unit.exposure_time.is_finite() && unit.exposure_time > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "{name}[{idx}]: exposure-time must be positive"
                )));
            }
            if !(unit.frame_rate.is_finite() && unit.frame_rate > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "{name}[{idx}]: frame-rate must be positive"
                )));
            }
            if unit.timeout == 0 {
                return Err(DaqError::Configuration(format!(
                    "{name}[{idx}]: timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn validate_address(device: &str, address: &str) -> AppResult<()> {
    if address.len() == 4 && address.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{device}: address must be 4 digits, got '{address}'"
        )))
    }
}

/// Longest accepted sampling interval (one day).
pub const MAX_INTERVAL_S: f64 = 86_400.0;

/// Longest accepted transport timeout.
pub const MAX_TIMEOUT_S: f64 = 3600.0;

fn validate_timeout(device: &str, key: &str, timeout: f64) -> AppResult<()> {
    if timeout.is_finite() && timeout > 0.0 && timeout <= MAX_TIMEOUT_S {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{device}: {key} must be a positive number of seconds up to {MAX_TIMEOUT_S}, got {timeout}"
        )))
    }
}

/// Convert a positive number of seconds, rejecting values no `Duration` can hold.
pub fn positive_duration(key: &str, value: f64) -> AppResult<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(DaqError::Configuration(format!(
            "Invalid {key} {value}. Must be a positive number of seconds"
        ))),
    }
}

// Timeouts are validated at classification; out-of-range values built by
// hand are clamped instead of panicking.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_TIMEOUT_S)).unwrap_or(Duration::ZERO)
}
