//! Outbound command send
//!
//! Each command opens a fresh TCP connection to the shuttle's command port,
//! writes a single `<TOKEN>[-NNN]\n` frame, waits for the write to drain and
//! closes. Failure classes map to structured error codes that the dispatcher
//! records into the shuttle's state.

use crate::config::ShuttleEndpoint;
use crate::dispatch::retry::Retriable;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Outbound send failures.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("timeout while sending")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("network error (errno {0})")]
    Net(i32),
    #[error("send failed: {0}")]
    Other(String),
}

impl SendError {
    /// Structured error token recorded into `ShuttleState.error_code`.
    pub fn error_code(&self) -> String {
        match self {
            SendError::Timeout => "TCP_TIMEOUT_SEND".to_string(),
            SendError::Refused => "CONNECTION_REFUSED".to_string(),
            SendError::Net(errno) => format!("NET_ERROR_{errno}"),
            SendError::Other(_) => "UNKNOWN_SEND_ERROR".to_string(),
        }
    }

    fn from_io(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::ConnectionRefused {
            SendError::Refused
        } else if let Some(errno) = err.raw_os_error() {
            SendError::Net(errno)
        } else {
            SendError::Other(err.to_string())
        }
    }
}

impl Retriable for SendError {
    fn is_retriable(&self) -> bool {
        // Timeouts, refusals and OS-level errors may clear up; anything
        // unclassified surfaces immediately.
        !matches!(self, SendError::Other(_))
    }
}

/// Deliver one wire frame to a shuttle's command port.
pub async fn send_line(
    endpoint: &ShuttleEndpoint,
    frame: &str,
    connect_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), SendError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.command_port);
    debug!(address = %addr, frame = frame.trim_end(), "Opening command connection");

    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| SendError::Timeout)?
        .map_err(|e| SendError::from_io(&e))?;

    tokio::time::timeout(write_timeout, async {
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| SendError::Timeout)?
    .map_err(|e| SendError::from_io(&e))?;

    let _ = stream.shutdown().await;

    info!(address = %addr, frame = frame.trim_end(), "Command delivered");
    Ok(())
}
