//! Inbound shuttle listener
//!
//! A single TCP acceptor for shuttle-initiated connections. Peers are
//! resolved to a shuttle id by their configured host; unknown peers are
//! rejected by closing. Each connection runs its own line loop: lines go to
//! the message interpreter, every non-`MRCD` line is acknowledged with
//! `MRCD\n` on the same connection, and a shuttle silent for longer than
//! the configured timeout is driven to `ERROR/TIMEOUT_NO_RESPONSE`.

use crate::config::Settings;
use crate::interpreter::MessageInterpreter;
use crate::metrics::GatewayMetrics;
use crate::store::StateStore;
use crate::types::ShuttleStatus;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Inbound listener for shuttle connections.
pub struct ShuttleListener {
    listener: TcpListener,
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    interpreter: Arc<MessageInterpreter>,
    metrics: Arc<GatewayMetrics>,
}

impl ShuttleListener {
    /// Bind the acceptor on the configured listener port.
    pub async fn bind(
        settings: Arc<Settings>,
        store: Arc<dyn StateStore>,
        interpreter: Arc<MessageInterpreter>,
        metrics: Arc<GatewayMetrics>,
    ) -> std::io::Result<Self> {
        let addr = format!("0.0.0.0:{}", settings.listener_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(address = %listener.local_addr()?, "Shuttle listener bound");
        Ok(Self {
            listener,
            settings,
            store,
            interpreter,
            metrics,
        })
    }

    /// Actual bound address (useful when the port was 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until cancelled; per-connection tasks observe the
    /// same token and unwind on shutdown.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shuttle listener shutting down");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let peer_host = peer.ip().to_string();
            let Some(shuttle_id) = self.settings.shuttle_by_host(&peer_host) else {
                warn!(peer = %peer, "Unknown shuttle peer, closing connection");
                drop(stream);
                continue;
            };
            let shuttle_id = shuttle_id.to_string();

            info!(shuttle_id, peer = %peer, "Shuttle connected");

            // Keepalive so half-open connections die instead of lingering
            let sock_ref = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(std::time::Duration::from_secs(30))
                .with_interval(std::time::Duration::from_secs(10));
            let _ = sock_ref.set_tcp_keepalive(&keepalive);

            self.metrics.connection_opened();

            let settings = Arc::clone(&self.settings);
            let store = Arc::clone(&self.store);
            let interpreter = Arc::clone(&self.interpreter);
            let metrics = Arc::clone(&self.metrics);
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                handle_connection(settings, store, interpreter, shuttle_id, stream, conn_cancel)
                    .await;
                metrics.connection_closed();
            });
        }
    }
}

/// Per-connection line loop.
async fn handle_connection(
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    interpreter: Arc<MessageInterpreter>,
    shuttle_id: String,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::with_capacity(256);
    let mut last_activity = Instant::now();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(settings.tcp_read_timeout, reader.read_line(&mut line)) => read,
        };

        match read {
            Ok(Ok(0)) => {
                info!(shuttle_id, "Shuttle closed the connection");
                break;
            }
            Ok(Ok(_)) => {
                let message = line.trim().to_string();
                if message.is_empty() {
                    continue;
                }
                last_activity = Instant::now();
                info!(shuttle_id, message = %message, "Shuttle message received");

                if let Err(e) = interpreter.apply(&shuttle_id, &message).await {
                    error!(shuttle_id, message = %message, error = %e, "Failed to process shuttle message");
                }

                if !message.eq_ignore_ascii_case("MRCD") {
                    let ack = tokio::time::timeout(
                        settings.tcp_write_timeout,
                        write_half.write_all(b"MRCD\n"),
                    )
                    .await;
                    match ack {
                        Ok(Ok(())) => debug!(shuttle_id, "MRCD acknowledgement sent"),
                        Ok(Err(e)) => {
                            warn!(shuttle_id, error = %e, "Failed to send MRCD, closing");
                            break;
                        }
                        Err(_) => {
                            warn!(shuttle_id, "MRCD write timed out, closing");
                            break;
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(shuttle_id, error = %e, "Read error, closing connection");
                break;
            }
            Err(_) => {
                // Read timeout: only fatal once the shuttle has been silent
                // past the protocol budget.
                if last_activity.elapsed() > settings.shuttle_timeout {
                    error!(
                        shuttle_id,
                        silent_secs = last_activity.elapsed().as_secs(),
                        "Shuttle unresponsive, marking ERROR"
                    );
                    let result = store.update(&shuttle_id, &mut |state| {
                        state.status = ShuttleStatus::Error;
                        state.error_code = Some("TIMEOUT_NO_RESPONSE".to_string());
                    });
                    if let Err(e) = result {
                        error!(shuttle_id, error = %e, "Failed to record shuttle timeout");
                    }
                    break;
                }
            }
        }
    }

    info!(shuttle_id, "Connection closed");
}
