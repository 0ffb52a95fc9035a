//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bundled archive templates.
pub fn template_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates")
}

/// Mock VIFCON bridge on 127.0.0.1.
///
/// Answers the n-th trigger with `responses[n]`, repeating the last response
/// once the list is exhausted. Every received trigger is forwarded on the
/// returned channel.
pub async fn spawn_vifcon(
    responses: Vec<String>,
) -> (u16, mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 256];
        let mut served = 0usize;
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let _ = triggers_tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
            let Some(response) = responses.get(served.min(responses.len().saturating_sub(1)))
            else {
                break;
            };
            if socket.write_all(response.as_bytes()).await.is_err() {
                break;
            }
            served += 1;
        }
    });

    (port, triggers_rx, handle)
}

/// Lines of a text file.
pub fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
