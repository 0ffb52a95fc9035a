//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, shared by every device driver,
//! transport adapter and output writer. Using the `thiserror` crate, it provides a single
//! taxonomy that separates failures local to one reading attempt from structural failures
//! that must stop a run.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: The transport of a device could not be opened at construction time.
//!   Sensor-style devices log this and keep running in a degraded mode that reports
//!   missing values; a camera array that cannot attach its units is skipped by the session.
//! - **`TransientRead`**: A single read timed out, returned a malformed response or could not
//!   be parsed. It is converted to missing-value sentinels at the device boundary and never
//!   escapes `sample()`.
//! - **`Acquisition`**: One physical unit of a camera array failed to deliver a frame. The
//!   error is carried in that unit's result only.
//! - **`Configuration`** / **`Config`**: Unsupported device shape, missing or unknown keys,
//!   or a configuration file that could not be extracted. Fatal.
//! - **`Io`**, **`OutputExists`**, **`Template`**: Output directory collisions, missing archive
//!   templates and other file system failures. Fatal at `init_output`.
//!
//! Use [`DaqError::is_recoverable`] to decide whether the acquisition loop may continue.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Error type shared by all devices, transports and writers.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport unavailable when the device was constructed.
    #[error("Connection to '{device}' not possible: {reason}")]
    Connection {
        /// Device name as configured.
        device: String,
        /// Human readable cause.
        reason: String,
    },

    /// One read attempt failed (timeout, malformed response, parse failure).
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// A camera unit failed to deliver a frame for this sample.
    #[error("Acquisition failed on camera unit {unit}: {reason}")]
    Acquisition {
        /// Stable context id of the unit.
        unit: usize,
        /// Human readable cause.
        reason: String,
    },

    /// Semantic configuration error (unsupported shape, invalid value).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file could not be read or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// File system or socket I/O failure outside a sample.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The output location of a device already exists.
    #[error("Output location already exists: {}", .0.display())]
    OutputExists(PathBuf),

    /// Archive template missing or structurally invalid.
    #[error("Archive template error: {0}")]
    Template(String),

    /// YAML or CSV serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A serial device was configured but serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// One or more devices failed to finalize or release their resources.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether the acquisition loop may continue after this error.
    ///
    /// Only failures local to one device or one reading attempt are recoverable;
    /// structural and configuration failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Connection { .. }
                | DaqError::TransientRead(_)
                | DaqError::Acquisition { .. }
                | DaqError::SerialFeatureDisabled
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<serde_yaml::Error> for DaqError {
    fn from(value: serde_yaml::Error) -> Self {
        DaqError::Serialization(value.to_string())
    }
}

impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        if value.is_io_error() {
            match value.into_kind() {
                csv::ErrorKind::Io(err) => DaqError::Io(err),
                other => DaqError::Serialization(format!("{other:?}")),
            }
        } else {
            DaqError::Serialization(value.to_string())
        }
    }
}

impl From<image::ImageError> for DaqError {
    fn from(value: image::ImageError) -> Self {
        match value {
            image::ImageError::IoError(err) => DaqError::Io(err),
            other => DaqError::Serialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_failures_are_recoverable() {
        let connection = DaqError::Connection {
            device: "Eurotherm".into(),
            reason: "port busy".into(),
        };
        assert!(connection.is_recoverable());
        assert!(DaqError::TransientRead("timeout".into()).is_recoverable());
        assert!(DaqError::Acquisition {
            unit: 1,
            reason: "buffer empty".into()
        }
        .is_recoverable());
    }

    #[test]
    fn structural_failures_are_fatal() {
        assert!(!DaqError::Configuration("unknown device".into()).is_recoverable());
        assert!(!DaqError::OutputExists(PathBuf::from("/tmp/x")).is_recoverable());
        assert!(!DaqError::Template("missing".into()).is_recoverable());
        assert!(!DaqError::ShutdownFailed(vec![]).is_recoverable());
    }

    #[test]
    fn connection_error_names_device() {
        let err = DaqError::Connection {
            device: "vifcon".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "Connection to 'vifcon' not possible: refused");
    }

    #[test]
    fn csv_io_errors_keep_their_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DaqError = csv::Error::from(io).into();
        match err {
            DaqError::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
