//! # multilog
//!
//! Acquisition core for a heterogeneous set of lab instruments: a camera array,
//! a temperature controller on a serial line or behind a TCP bridge, and a
//! generator behind the same bridge. Every device is sampled on a fixed
//! cadence, writes its readings to a per-device CSV log and describes what it
//! recorded in a YAML archive document.
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded with figment, and shape-based classification of
//!   device entries into typed per-variant configuration.
//! - **`error`**: the `DaqError` taxonomy shared by all layers.
//! - **`logging`**: `tracing-subscriber` setup (pretty, compact or JSON output).
//! - **`measurement`**: samples, measurement records, timestamp formatting and the
//!   persistence drift check.
//! - **`hardware`**: transport adapters (serial, TCP) and the camera SDK boundary.
//! - **`data`**: the CSV measurement log and the archive composer.
//! - **`instrument`**: the `Instrument` contract, its device variants and the
//!   `connect_device` factory.
//! - **`session`**: the fixed-cadence acquisition loop used by the `multilog` binary.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod session;

pub use error::{AppResult, DaqError};
pub use instrument::{connect_device, Device, DeviceContext, Instrument};
pub use session::{AcquisitionSession, RunSummary};

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    pub const SENSOR_TEMPLATE: &str = include_str!("../templates/archive_template_sensor.yml");
    pub const CAMERA_TEMPLATE: &str = include_str!("../templates/archive_template_camera.yml");

    /// Place the bundled archive templates in `dir`.
    pub fn write_templates(dir: &Path) {
        std::fs::write(dir.join(crate::data::archive::SENSOR_TEMPLATE), SENSOR_TEMPLATE).unwrap();
        std::fs::write(dir.join(crate::data::archive::CAMERA_TEMPLATE), CAMERA_TEMPLATE).unwrap();
    }
}
