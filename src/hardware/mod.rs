//! Transport adapters for the instruments.
//!
//! Low-level request/response mechanisms underlying `sample()`:
//!
//! - [`serial`]: byte-framed command/response over RS-232 (temperature controller)
//! - [`tcp`]: name trigger → JSON response over a TCP socket (controller, generator)
//! - [`camera`]: the camera vendor SDK as an opaque "acquire a frame or fail" capability
//!
//! Both byte transports follow the same state machine:
//!
//! ```text
//! Disconnected → Connecting → Ready → [Reading ⇄ Ready] → Closed
//! ```
//!
//! A failed open leaves the adapter `Disconnected` for the rest of the run. A read
//! failure is a per-call outcome and does not leave `Ready`; there is no reconnect.

pub mod camera;
pub mod serial;
pub mod tcp;

pub use camera::{CameraBackend, CameraInfo, CameraSdk, PixelFormat, RawFrame, SimulatedCameraSdk};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use crate::error::DaqError;
use std::fmt;

/// Connection state of a transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Never opened, or the open attempt failed. Reads yield missing values.
    Disconnected,
    /// Open in progress.
    Connecting,
    /// Open and idle.
    Ready,
    /// A request/response exchange is in flight.
    Reading,
    /// Released by `close()`.
    Closed,
}

impl TransportState {
    /// Whether requests can be issued.
    pub fn is_ready(self) -> bool {
        matches!(self, TransportState::Ready)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Ready => "ready",
            TransportState::Reading => "reading",
            TransportState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// An error that can occur during one request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The adapter is not in the `Ready` state.
    #[error("Not connected ({0})")]
    NotConnected(TransportState),

    /// No (complete) response within the deadline.
    #[error("Timed out waiting for response")]
    Timeout,

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The response could not be decoded or parsed.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// An expected field is absent from the response.
    #[error("Missing field '{0}' in response")]
    MissingField(String),

    /// Underlying read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for DaqError {
    fn from(value: TransportError) -> Self {
        DaqError::TransientRead(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_accepts_requests() {
        assert!(TransportState::Ready.is_ready());
        assert!(!TransportState::Disconnected.is_ready());
        assert!(!TransportState::Reading.is_ready());
        assert!(!TransportState::Closed.is_ready());
    }

    #[test]
    fn transport_errors_become_transient_reads() {
        let err: DaqError = TransportError::MissingField("IWT".into()).into();
        assert!(matches!(err, DaqError::TransientRead(ref msg) if msg.contains("IWT")));
        assert!(err.is_recoverable());
    }
}
