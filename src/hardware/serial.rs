//! Serial line adapter for command/response instruments.
//!
//! Protocol (Eurotherm-style bisynch):
//! - Command: `0x04` + 4-digit channel code + 2-char mnemonic + `0x05`
//!   (e.g. `"\x040000PV\x05"` reads the process value)
//! - Response: one line `0x02` + mnemonic echo + value + `0x03` + block check.
//!   After trailing CR/LF are removed the payload sits at a fixed offset: 3
//!   leading bytes (start byte + mnemonic echo) and 2 trailing bytes (end byte +
//!   block check) are dropped, the rest is a decimal number. A line without the
//!   start and end bytes in place, or echoing another mnemonic, is malformed.
//!
//! The port is opened once. If that fails the adapter stays `Disconnected` and
//! every query fails fast with [`TransportError::NotConnected`], so sampling
//! degrades to missing values without retrying the port.

use super::{TransportError, TransportState};
use crate::config::SerialInterfaceConfig;
use crate::error::DaqError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;

/// Start-of-command control byte.
pub const EOT: u8 = 0x04;
/// End-of-command control byte.
pub const ENQ: u8 = 0x05;
/// Start-of-response control byte.
pub const STX: u8 = 0x02;
/// End-of-value control byte of a response.
pub const ETX: u8 = 0x03;

/// Bytes dropped from the start of a response line.
const RESPONSE_HEAD: usize = 3;
/// Bytes dropped from the end of a response line.
const RESPONSE_TAIL: usize = 2;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port: `tokio_serial::SerialStream` on hardware,
/// `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Build a framed command for `channel_code` (4 digits) and `mnemonic`.
pub fn frame_command(channel_code: &str, mnemonic: &str) -> Vec<u8> {
    let mut command = Vec::with_capacity(channel_code.len() + mnemonic.len() + 2);
    command.push(EOT);
    command.extend_from_slice(channel_code.as_bytes());
    command.extend_from_slice(mnemonic.as_bytes());
    command.push(ENQ);
    command
}

/// Extract the decimal payload of a response line to `mnemonic`.
pub fn parse_response(line: &[u8], mnemonic: &str) -> Result<f64, TransportError> {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    let line = &line[..end];
    if end < RESPONSE_HEAD + RESPONSE_TAIL + 1 {
        return Err(TransportError::Malformed(format!(
            "response too short ({end} bytes): {:?}",
            String::from_utf8_lossy(line)
        )));
    }

    // A reply cut off at the deadline lacks ETX; its digits are not a value.
    if line[0] != STX || line[end - RESPONSE_TAIL] != ETX {
        return Err(TransportError::Malformed(format!(
            "incomplete frame: {:?}",
            String::from_utf8_lossy(line)
        )));
    }
    let echo = &line[1..RESPONSE_HEAD];
    if echo != mnemonic.as_bytes() {
        return Err(TransportError::Malformed(format!(
            "reply to '{}' while reading '{mnemonic}'",
            String::from_utf8_lossy(echo)
        )));
    }

    let payload = &line[RESPONSE_HEAD..end - RESPONSE_TAIL];
    let text = std::str::from_utf8(payload)
        .map_err(|e| TransportError::Malformed(format!("invalid UTF-8 payload: {e}")))?;
    text.trim()
        .parse::<f64>()
        .map_err(|e| TransportError::Malformed(format!("cannot parse '{}': {e}", text.trim())))
}

/// Serial command/response adapter.
pub struct SerialTransport {
    device: String,
    port: Option<BufReader<DynSerial>>,
    state: TransportState,
    timeout: Duration,
}

impl SerialTransport {
    /// Open the configured serial port.
    ///
    /// Never fails: if the port cannot be opened the failure is logged and
    /// the adapter is returned in the `Disconnected` state.
    pub async fn open(device: &str, config: &SerialInterfaceConfig) -> Self {
        let timeout = config.timeout();
        let mut transport = Self {
            device: device.to_string(),
            port: None,
            state: TransportState::Connecting,
            timeout,
        };

        match open_port(device, config).await {
            Ok(port) => {
                tracing::info!(device, port = %config.port, "Serial port opened");
                transport.port = Some(BufReader::new(port));
                transport.state = TransportState::Ready;
            }
            Err(err) => {
                tracing::error!(device, port = %config.port, error = %err, "Connection to {device} not possible");
                transport.state = TransportState::Disconnected;
            }
        }
        transport
    }

    /// Wrap an already open port (used for tests and pre-opened handles).
    pub fn with_port(device: &str, port: DynSerial, timeout: Duration) -> Self {
        Self {
            device: device.to_string(),
            port: Some(BufReader::new(port)),
            state: TransportState::Ready,
            timeout,
        }
    }

    /// Adapter without a port, as after a failed open.
    pub fn disconnected(device: &str, timeout: Duration) -> Self {
        Self {
            device: device.to_string(),
            port: None,
            state: TransportState::Disconnected,
            timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Configured read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write `command`, read one line and parse its `mnemonic` payload, giving
    /// up at `deadline`.
    ///
    /// A failure leaves the adapter `Ready`.
    pub async fn query_until(
        &mut self,
        command: &[u8],
        mnemonic: &str,
        deadline: Instant,
    ) -> Result<f64, TransportError> {
        if !self.state.is_ready() {
            return Err(TransportError::NotConnected(self.state));
        }
        let port = self
            .port
            .as_mut()
            .ok_or(TransportError::NotConnected(TransportState::Disconnected))?;

        self.state = TransportState::Reading;
        let result = exchange(port, command, deadline).await;
        self.state = TransportState::Ready;

        let line = result?;
        tracing::trace!(device = %self.device, response = ?String::from_utf8_lossy(&line), "Serial response");
        parse_response(&line, mnemonic)
    }

    /// [`query_until`](Self::query_until) with a deadline of one timeout from now.
    pub async fn query(&mut self, command: &[u8], mnemonic: &str) -> Result<f64, TransportError> {
        let deadline = Instant::now() + self.timeout;
        self.query_until(command, mnemonic, deadline).await
    }

    /// Release the port.
    pub async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(err) = port.get_mut().shutdown().await {
                tracing::debug!(device = %self.device, error = %err, "Serial shutdown reported an error");
            }
        }
        self.state = TransportState::Closed;
    }
}

async fn exchange(
    port: &mut BufReader<DynSerial>,
    command: &[u8],
    deadline: Instant,
) -> Result<Vec<u8>, TransportError> {
    tokio::time::timeout_at(deadline, async {
        port.get_mut().write_all(command).await?;
        port.get_mut().flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    // Like a serial readline with a timeout: whatever arrived before the
    // deadline is the response, even without a line terminator.
    let mut line = Vec::new();
    match tokio::time::timeout_at(deadline, port.read_until(b'\n', &mut line)).await {
        Ok(Ok(0)) if line.is_empty() => Err(TransportError::ConnectionClosed),
        Ok(Ok(_)) => Ok(line),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) if !line.is_empty() => Ok(line),
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_port(device: &str, config: &SerialInterfaceConfig) -> Result<DynSerial, DaqError> {
    use tokio_serial::SerialPortBuilderExt;

    let builder = tokio_serial::new(&config.port, config.baudrate)
        .data_bits(config.data_bits())
        .parity(config.parity())
        .stop_bits(config.stop_bits())
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.timeout());

    let device_owned = device.to_string();
    let port = tokio::task::spawn_blocking(move || builder.open_native_async())
        .await
        .map_err(|e| DaqError::Connection {
            device: device_owned.clone(),
            reason: format!("spawn_blocking for serial port opening failed: {e}"),
        })?
        .map_err(|e| DaqError::Connection {
            device: device_owned,
            reason: e.to_string(),
        })?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_port(_device: &str, _config: &SerialInterfaceConfig) -> Result<DynSerial, DaqError> {
    Err(DaqError::SerialFeatureDisabled)
}
