//! Command worker loop
//!
//! Workers sweep the fleet: for every shuttle whose mutex is free and whose
//! state is `FREE`, one command is dequeued and executed under the mutex.
//! Between sweeps workers sleep briefly to avoid busy spinning. Commands
//! cancelled between enqueue and pickup are discarded without sending.

use super::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pause between fleet sweeps.
const WORKER_SCAN_INTERVAL: Duration = Duration::from_millis(500);

impl Dispatcher {
    /// Worker loop; run one task per configured worker.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "Command worker started");
        loop {
            self.sweep().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker_id, "Command worker stopping");
                    return;
                }
                _ = tokio::time::sleep(WORKER_SCAN_INTERVAL) => {}
            }
        }
    }

    /// One pass over all shuttles, executing at most one queued command per
    /// idle shuttle.
    pub(crate) async fn sweep(&self) {
        for (shuttle_id, channel) in &self.channels {
            // A held mutex means a bypass command or another worker is
            // already talking to this shuttle.
            let Ok(_guard) = channel.lock.try_lock() else {
                continue;
            };

            let state = match self.store.get(shuttle_id) {
                Ok(Some(state)) => state,
                _ => continue,
            };
            if state.status != crate::types::ShuttleStatus::Free {
                continue;
            }

            let Some(entry) = channel.pop() else {
                continue;
            };
            self.metrics.set_queue_size(self.total_queued());

            let envelope = entry.envelope;
            if self.registry.is_cancelled(&envelope.id) {
                debug!(command_id = %envelope.id, "Skipping cancelled command");
                continue;
            }

            self.registry.mark_processing(&envelope.id);
            let result = self.execute_envelope(&envelope).await;
            self.registry.complete(&envelope.id, result.is_ok());
        }
    }
}
