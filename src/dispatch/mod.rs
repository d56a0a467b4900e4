//! Dispatch core
//!
//! Central coordination of WMS commands against the shuttle fleet:
//! - one bounded priority queue per shuttle, ordered by
//!   `(priority asc, enqueue sequence asc)`
//! - one non-reentrant mutex per shuttle: at most one command is in flight
//!   to a given shuttle at any time
//! - bypass commands (`HOME`, `STATUS`, `MRCD`, `BATTERY`, `WDH`, `WLH`)
//!   skip the queue and execute immediately under the mutex — `HOME` is the
//!   emergency stop and must never wait behind queued work
//! - a small worker pool drains the queues for shuttles that are `FREE`
//! - best-effort cancellation of still-queued commands
//! - send retries with exponential backoff and jitter

pub mod registry;
pub mod retry;
mod worker;

pub use registry::{CommandRecord, CommandRegistry};
pub use retry::{retry_with_backoff, RetryPolicy};

use crate::config::Settings;
use crate::metrics::GatewayMetrics;
use crate::store::{StateStore, StoreError};
use crate::transport::{self, SendError};
use crate::types::{
    now_unix_millis, CommandEnvelope, CommandStatus, ShuttleCommand, ShuttleStatus,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default priority for submissions that do not specify one.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Submission errors, mapped by the API surface onto HTTP categories.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown shuttle: {0}")]
    UnknownShuttle(String),
    #[error("shuttle {0} is busy")]
    Busy(String),
    #[error("invalid params for {command}: {reason}")]
    BadParams {
        command: ShuttleCommand,
        reason: String,
    },
    #[error("command queue full for shuttle {0}")]
    QueueFull(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("command delivery failed: {0}")]
    Send(#[from] SendError),
}

/// Successful submission result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Command accepted into the shuttle's queue; the id permits later
    /// cancellation.
    Queued(String),
    /// Bypass command executed immediately.
    Executed,
}

/// A command submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub shuttle_id: String,
    pub command: ShuttleCommand,
    pub params: Option<String>,
    pub external_id: Option<String>,
    pub priority: Option<i32>,
    pub document_type: Option<String>,
}

impl SubmitRequest {
    pub fn new(shuttle_id: impl Into<String>, command: ShuttleCommand) -> Self {
        Self {
            shuttle_id: shuttle_id.into(),
            command,
            params: None,
            external_id: None,
            priority: None,
            document_type: None,
        }
    }
}

/// Urgency table; the effective priority is the minimum of this and the
/// caller's request, so a submission can raise urgency but never lower it.
fn table_priority(command: ShuttleCommand) -> i32 {
    match command {
        ShuttleCommand::Home => 1,
        ShuttleCommand::Status => 2,
        ShuttleCommand::Battery => 3,
        ShuttleCommand::Mrcd => 4,
        // Unloading beats loading
        ShuttleCommand::PalletOut => 5,
        ShuttleCommand::PalletIn => 6,
        ShuttleCommand::StackOut => 7,
        ShuttleCommand::StackIn => 8,
        ShuttleCommand::Fifo => 9,
        ShuttleCommand::Filo => 10,
        ShuttleCommand::Count => 11,
        ShuttleCommand::Wdh => 12,
        ShuttleCommand::Wlh => 13,
    }
}

pub(crate) fn effective_priority(command: ShuttleCommand, requested: i32) -> i32 {
    table_priority(command).min(requested)
}

/// Execution-time admission: non-bypass commands require an idle shuttle.
/// `PALLET_OUT` is additionally admitted from `BUSY`: unloading is the one
/// operation valid with cargo on board.
pub(crate) fn admission_allows(status: ShuttleStatus, command: ShuttleCommand) -> bool {
    matches!(status, ShuttleStatus::Free | ShuttleStatus::Unknown)
        || (command == ShuttleCommand::PalletOut && status == ShuttleStatus::Busy)
}

/// Queue entry ordered by `(priority, seq)`.
struct QueuedEntry {
    priority: i32,
    seq: u64,
    envelope: CommandEnvelope,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Per-shuttle queue and execution mutex.
struct ShuttleChannel {
    /// Serializes bypass execution, queued execution and cancel drains.
    lock: tokio::sync::Mutex<()>,
    queue: Mutex<BinaryHeap<Reverse<QueuedEntry>>>,
}

impl ShuttleChannel {
    fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            queue: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Enqueue unless the queue is at capacity.
    fn push(&self, entry: QueuedEntry, max_size: usize) -> bool {
        let Ok(mut queue) = self.queue.lock() else {
            return false;
        };
        if queue.len() >= max_size {
            return false;
        }
        queue.push(Reverse(entry));
        true
    }

    fn pop(&self) -> Option<QueuedEntry> {
        self.queue.lock().ok()?.pop().map(|Reverse(entry)| entry)
    }

    /// Drop one command by id, preserving the order of the survivors.
    /// Must be called with the channel lock held.
    fn remove(&self, command_id: &str) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        let survivors: BinaryHeap<Reverse<QueuedEntry>> = queue
            .drain()
            .filter(|item| item.0.envelope.id != command_id)
            .collect();
        *queue = survivors;
    }

    fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Command dispatcher for the whole fleet.
pub struct Dispatcher {
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<GatewayMetrics>,
    channels: HashMap<String, Arc<ShuttleChannel>>,
    seq: AtomicU64,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn StateStore>,
        registry: Arc<CommandRegistry>,
        metrics: Arc<GatewayMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        let channels = settings
            .shuttles
            .keys()
            .map(|id| (id.clone(), Arc::new(ShuttleChannel::new())))
            .collect::<HashMap<_, _>>();
        info!(shuttles = channels.len(), "Dispatcher initialised");
        Self {
            settings,
            store,
            registry,
            metrics,
            channels,
            seq: AtomicU64::new(0),
            retry,
        }
    }

    pub fn registry(&self) -> Arc<CommandRegistry> {
        Arc::clone(&self.registry)
    }

    /// Submit a command for a shuttle.
    ///
    /// Bypass commands execute immediately under the shuttle's mutex and
    /// return [`SubmitOutcome::Executed`]; everything else is queued and
    /// returns the command id for cancellation.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, SubmitError> {
        let Some(channel) = self.channels.get(&request.shuttle_id) else {
            warn!(shuttle_id = %request.shuttle_id, "Submission for unknown shuttle");
            self.metrics.record_command("failure_not_found");
            return Err(SubmitError::UnknownShuttle(request.shuttle_id));
        };

        // Validate parameters synchronously so malformed input never
        // reaches the queue.
        if let Err(reason) = request.command.wire_frame(request.params.as_deref()) {
            self.metrics.record_command("failure_bad_params");
            return Err(SubmitError::BadParams {
                command: request.command,
                reason,
            });
        }

        let envelope = CommandEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            shuttle_id: request.shuttle_id,
            command: request.command,
            params: request.params,
            external_id: request.external_id,
            priority: effective_priority(
                request.command,
                request.priority.unwrap_or(DEFAULT_PRIORITY),
            ),
            document_type: request.document_type,
            enqueued_at: now_unix_millis(),
        };

        if envelope.command.is_bypass() {
            let _guard = channel.lock.lock().await;
            self.execute_envelope(&envelope).await?;
            info!(
                shuttle_id = %envelope.shuttle_id,
                command = %envelope.command,
                "Bypass command executed"
            );
            return Ok(SubmitOutcome::Executed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.registry.insert(envelope.clone());
        let accepted = channel.push(
            QueuedEntry {
                priority: envelope.priority,
                seq,
                envelope: envelope.clone(),
            },
            self.settings.command_queue_max_size,
        );
        if !accepted {
            self.registry.remove(&envelope.id);
            warn!(
                shuttle_id = %envelope.shuttle_id,
                command = %envelope.command,
                "Command queue full, submission rejected"
            );
            self.metrics.record_command("failure_queue_full");
            return Err(SubmitError::QueueFull(envelope.shuttle_id));
        }

        self.metrics.set_queue_size(self.total_queued());
        info!(
            shuttle_id = %envelope.shuttle_id,
            command = %envelope.command,
            priority = envelope.priority,
            command_id = %envelope.id,
            "Command queued"
        );
        Ok(SubmitOutcome::Queued(envelope.id))
    }

    /// Best-effort cancellation of a queued command. Fails once the command
    /// is processing or terminal.
    pub async fn cancel(&self, command_id: &str) -> bool {
        let Some(record) = self.registry.get(command_id) else {
            warn!(command_id, "Cancellation for unknown command");
            return false;
        };
        if record.status != CommandStatus::Queued {
            warn!(command_id, status = %record.status, "Command no longer cancellable");
            return false;
        }
        let Some(channel) = self.channels.get(&record.envelope.shuttle_id) else {
            return false;
        };

        let _guard = channel.lock.lock().await;
        // The worker may have picked the command up while we waited.
        if !self.registry.mark_cancelled(command_id) {
            return false;
        }
        channel.remove(command_id);
        self.metrics.set_queue_size(self.total_queued());
        info!(
            command_id,
            shuttle_id = %record.envelope.shuttle_id,
            "Command cancelled"
        );
        true
    }

    /// Queued command count for one shuttle.
    pub fn queued_for(&self, shuttle_id: &str) -> usize {
        self.channels.get(shuttle_id).map_or(0, |c| c.len())
    }

    fn total_queued(&self) -> u64 {
        self.channels.values().map(|c| c.len() as u64).sum()
    }

    /// Execute one command against its shuttle. Callers must hold the
    /// shuttle's channel lock.
    async fn execute_envelope(&self, envelope: &CommandEnvelope) -> Result<(), SubmitError> {
        let state = match self.store.get(&envelope.shuttle_id) {
            Ok(Some(state)) => state,
            Ok(None) => {
                self.metrics.record_command("failure_not_found");
                return Err(SubmitError::UnknownShuttle(envelope.shuttle_id.clone()));
            }
            Err(e) => {
                self.metrics.record_command("failure_store");
                return Err(SubmitError::Store(e));
            }
        };

        if !envelope.command.is_bypass() && !admission_allows(state.status, envelope.command) {
            warn!(
                shuttle_id = %envelope.shuttle_id,
                command = %envelope.command,
                status = %state.status,
                "Command rejected: shuttle not idle"
            );
            self.metrics.record_command("failure_busy");
            return Err(SubmitError::Busy(envelope.shuttle_id.clone()));
        }

        if envelope.command == ShuttleCommand::Home && state.current_command.is_some() {
            debug!(
                shuttle_id = %envelope.shuttle_id,
                interrupted = state.current_command.as_deref(),
                "HOME interrupts the current operation"
            );
            self.store
                .update(&envelope.shuttle_id, &mut |s| s.current_command = None)?;
        }

        let frame = match envelope.command.wire_frame(envelope.params.as_deref()) {
            Ok(frame) => frame,
            Err(reason) => {
                self.metrics.record_command("failure_bad_params");
                return Err(SubmitError::BadParams {
                    command: envelope.command,
                    reason,
                });
            }
        };

        let Some(endpoint) = self.settings.endpoint(&envelope.shuttle_id) else {
            self.metrics.record_command("failure_not_found");
            return Err(SubmitError::UnknownShuttle(envelope.shuttle_id.clone()));
        };

        let send_result = retry_with_backoff(self.retry, envelope.command.wire_token(), || {
            transport::send_line(
                endpoint,
                &frame,
                self.settings.tcp_connect_timeout,
                self.settings.tcp_write_timeout,
            )
        })
        .await;

        match send_result {
            Ok(()) => {
                let sent = frame.trim_end().to_string();
                let is_home = envelope.command == ShuttleCommand::Home;
                let is_mrcd = envelope.command == ShuttleCommand::Mrcd;
                // Bypass probes without a correlation id must not clobber
                // the id of the command owning the shuttle.
                let overwrite_correlation =
                    !envelope.command.is_bypass() || envelope.external_id.is_some();
                let external_id = envelope.external_id.clone();
                let document_type = envelope.document_type.clone();
                self.store.update(&envelope.shuttle_id, &mut |s| {
                    s.last_message_received_from_wms = Some(sent.clone());
                    if overwrite_correlation {
                        s.external_id = external_id.clone();
                        s.document_type = document_type.clone();
                    }
                    if is_home {
                        s.status = ShuttleStatus::Free;
                        s.current_command = None;
                    } else if !is_mrcd {
                        s.current_command = Some(sent.clone());
                    }
                })?;
                self.metrics.record_command("success");
                Ok(())
            }
            Err(e) => {
                let code = e.error_code();
                warn!(
                    shuttle_id = %envelope.shuttle_id,
                    command = %envelope.command,
                    error_code = %code,
                    "Command delivery failed after retries"
                );
                let result = self.store.update(&envelope.shuttle_id, &mut |s| {
                    s.status = ShuttleStatus::Error;
                    s.error_code = Some(code.clone());
                });
                if let Err(store_err) = result {
                    warn!(error = %store_err, "Failed to record send failure");
                }
                self.metrics.record_command("failure_send_error");
                Err(SubmitError::Send(e))
            }
        }
    }
}
