//! TCP socket adapter: name trigger → JSON response.
//!
//! Protocol (VIFCON bridge):
//! - Request: the UTF-8 bytes of the requesting device's configured name
//! - Response: one UTF-8 JSON object, read with a single buffered read of up to
//!   [`RESPONSE_BUFFER_SIZE`] bytes, e.g. `{"IWT": 10.5, "SWT": 10.0, "IWOp": 50.0}`
//!
//! One exchange per `sample()`. Any failure (reset, malformed JSON, missing key)
//! is reported as a [`TransportError`]; the device turns it into missing values.
//!
//! A reply that arrives after its exchange timed out is still queued on the
//! socket. Everything already received is discarded before a trigger is sent,
//! so such a reply is never taken as the answer to the next trigger.

use super::{TransportError, TransportState};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum response size read per exchange.
pub const RESPONSE_BUFFER_SIZE: usize = 1024;

/// Request/response adapter over a TCP socket.
pub struct TcpTransport {
    device: String,
    stream: Option<TcpStream>,
    state: TransportState,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to `ip:port`, giving up after `timeout`.
    ///
    /// Never fails: an unreachable peer is logged and the adapter is returned
    /// in the `Disconnected` state.
    pub async fn connect(device: &str, ip: &str, port: u16, timeout: Duration) -> Self {
        let mut transport = Self {
            device: device.to_string(),
            stream: None,
            state: TransportState::Connecting,
            timeout,
        };

        let address = format!("{ip}:{port}");
        match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!(device, error = %err, "Could not disable Nagle");
                }
                tracing::info!(device, %address, "{device} connected to VIFCON");
                transport.stream = Some(stream);
                transport.state = TransportState::Ready;
            }
            Ok(Err(err)) => {
                tracing::error!(device, %address, error = %err, "Connection to {device} not possible");
                transport.state = TransportState::Disconnected;
            }
            Err(_) => {
                tracing::error!(device, %address, timeout_s = timeout.as_secs_f64(), "Connection to {device} timed out");
                transport.state = TransportState::Disconnected;
            }
        }
        transport
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Configured exchange timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send the trigger and decode the JSON object that comes back.
    ///
    /// A failure leaves the adapter `Ready`.
    pub async fn request(&mut self) -> Result<Map<String, Value>, TransportError> {
        if !self.state.is_ready() {
            return Err(TransportError::NotConnected(self.state));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(TransportError::NotConnected(TransportState::Disconnected))?;

        self.state = TransportState::Reading;
        let result = tokio::time::timeout(self.timeout, exchange(stream, &self.device)).await;
        self.state = TransportState::Ready;

        let payload = result.map_err(|_| TransportError::Timeout)??;
        tracing::trace!(device = %self.device, response = %payload, "TCP response");
        parse_object(&payload)
    }

    /// Send the trigger and extract `keys` as numbers, in order.
    pub async fn request_fields(&mut self, keys: &[&str]) -> Result<Vec<f64>, TransportError> {
        let object = self.request().await?;
        extract_fields(&object, keys)
    }

    /// Shut down the socket.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                tracing::debug!(device = %self.device, error = %err, "TCP shutdown reported an error");
            }
        }
        self.state = TransportState::Closed;
    }
}

async fn exchange(stream: &mut TcpStream, trigger: &str) -> Result<String, TransportError> {
    discard_stale(stream, trigger)?;
    stream.write_all(trigger.as_bytes()).await?;

    let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(TransportError::ConnectionClosed);
    }
    buf.truncate(n);
    String::from_utf8(buf).map_err(|e| TransportError::Malformed(format!("invalid UTF-8: {e}")))
}

/// Drop whatever the peer sent before the next trigger, without waiting.
fn discard_stale(stream: &TcpStream, device: &str) -> Result<usize, TransportError> {
    let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
    let mut discarded = 0;
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => discarded += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    if discarded > 0 {
        tracing::warn!(device, bytes = discarded, "Discarded late response from a previous exchange");
    }
    Ok(discarded)
}

/// Parse a response as a JSON object.
pub fn parse_object(payload: &str) -> Result<Map<String, Value>, TransportError> {
    match serde_json::from_str::<Value>(payload.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(TransportError::Malformed(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(err) => Err(TransportError::Malformed(format!("invalid JSON: {err}"))),
    }
}

/// Extract numeric fields by key, in the order given.
pub fn extract_fields(object: &Map<String, Value>, keys: &[&str]) -> Result<Vec<f64>, TransportError> {
    keys.iter()
        .map(|key| {
            let value = object
                .get(*key)
                .ok_or_else(|| TransportError::MissingField((*key).to_string()))?;
            value.as_f64().ok_or_else(|| {
                TransportError::Malformed(format!("field '{key}' is not a number: {value}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn fields_are_extracted_in_requested_order() {
        let object = parse_object(r#"{"SWT": 10.0, "IWT": 10.5, "IWOp": 50}"#).unwrap();
        let values = extract_fields(&object, &["IWT", "SWT", "IWOp"]).unwrap();
        assert_eq!(values, [10.5, 10.0, 50.0]);
    }

    #[test]
    fn missing_key_is_reported() {
        let object = parse_object(r#"{"IWT": 10.5}"#).unwrap();
        let err = extract_fields(&object, &["IWT", "SWT"]).unwrap_err();
        assert!(matches!(err, TransportError::MissingField(ref key) if key == "SWT"));
    }

    #[test]
    fn non_object_and_garbage_are_malformed() {
        assert!(matches!(parse_object("[1, 2]"), Err(TransportError::Malformed(_))));
        assert!(matches!(parse_object("{\"IWT\": "), Err(TransportError::Malformed(_))));
        let object = parse_object(r#"{"IWT": "hot"}"#).unwrap();
        assert!(matches!(extract_fields(&object, &["IWT"]), Err(TransportError::Malformed(_))));
    }

    #[tokio::test]
    async fn unreachable_peer_leaves_adapter_disconnected() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport =
            TcpTransport::connect("vifcon", "127.0.0.1", port, Duration::from_millis(200)).await;
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(matches!(
            transport.request().await,
            Err(TransportError::NotConnected(TransportState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_one() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let mut count = 0;
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                count += 1;
                if count == 1 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let reply = format!(r#"{{"IWT": {count}.0}}"#);
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut transport =
            TcpTransport::connect("vifcon", "127.0.0.1", port, Duration::from_millis(200)).await;
        assert!(matches!(
            transport.request_fields(&["IWT"]).await,
            Err(TransportError::Timeout)
        ));

        // Let the late reply land before the next tick.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(transport.request_fields(&["IWT"]).await.unwrap(), [2.0]);
        assert_eq!(transport.request_fields(&["IWT"]).await.unwrap(), [3.0]);
    }

    #[tokio::test]
    async fn request_sends_device_name_as_trigger() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(br#"{"IWP": 1.5}"#).await.unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        let mut transport =
            TcpTransport::connect("vifcon", "127.0.0.1", port, Duration::from_secs(1)).await;
        let values = transport.request_fields(&["IWP"]).await.unwrap();

        assert_eq!(values, [1.5]);
        assert_eq!(server.await.unwrap(), "vifcon");
        assert_eq!(transport.state(), TransportState::Ready);
    }
}
