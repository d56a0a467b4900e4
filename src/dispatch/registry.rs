//! Command registry
//!
//! In-memory map from command id to its envelope and lifecycle status
//! (`queued → processing → completed|failed|cancelled`), plus the
//! `wms_updated` flag the WMS integration consumes when pushing completion
//! statuses back. The webhook reporter holds the registry as a read-only
//! query interface; only the dispatcher mutates it.

use crate::types::{now_unix_secs, CommandEnvelope, CommandStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// A registered command and its lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub envelope: CommandEnvelope,
    pub status: CommandStatus,
    /// Unix seconds when the command reached a terminal status.
    pub completed_at: Option<u64>,
    /// Set once the completion has been pushed to the WMS.
    pub wms_updated: bool,
}

/// Registry of all commands accepted by the dispatcher.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    entries: Mutex<HashMap<String, CommandRecord>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly queued command.
    pub fn insert(&self, envelope: CommandEnvelope) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                envelope.id.clone(),
                CommandRecord {
                    envelope,
                    status: CommandStatus::Queued,
                    completed_at: None,
                    wms_updated: false,
                },
            );
        }
    }

    /// Remove an entry entirely (used when an enqueue is rolled back).
    pub fn remove(&self, command_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(command_id);
        }
    }

    pub fn get(&self, command_id: &str) -> Option<CommandRecord> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(command_id).cloned())
    }

    pub fn status(&self, command_id: &str) -> Option<CommandStatus> {
        self.get(command_id).map(|r| r.status)
    }

    /// Accept-stale cancellation check used by workers between dequeue and
    /// execution; the cancelled flag is monotone.
    pub fn is_cancelled(&self, command_id: &str) -> bool {
        self.status(command_id) == Some(CommandStatus::Cancelled)
    }

    pub fn mark_processing(&self, command_id: &str) {
        self.set_status(command_id, CommandStatus::Processing, false);
    }

    /// Transition a queued command to cancelled. Returns false when the
    /// command is already processing or terminal.
    pub fn mark_cancelled(&self, command_id: &str) -> bool {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(record) = entries.get_mut(command_id) {
                if record.status == CommandStatus::Queued {
                    record.status = CommandStatus::Cancelled;
                    record.completed_at = Some(now_unix_secs());
                    return true;
                }
                warn!(
                    command_id,
                    status = %record.status,
                    "Cancellation rejected: command no longer queued"
                );
            }
        }
        false
    }

    /// Record the execution outcome of a dequeued command.
    pub fn complete(&self, command_id: &str, success: bool) {
        let status = if success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        self.set_status(command_id, status, true);
    }

    fn set_status(&self, command_id: &str, status: CommandStatus, terminal: bool) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(record) = entries.get_mut(command_id) {
                record.status = status;
                if terminal {
                    record.completed_at = Some(now_unix_secs());
                }
            }
        }
    }

    /// Correlation id of the command currently owning a shuttle, if any.
    /// Consulted by the webhook reporter when the state record carries none.
    pub fn active_external_id(&self, shuttle_id: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .values()
            .filter(|r| {
                r.envelope.shuttle_id == shuttle_id
                    && matches!(r.status, CommandStatus::Queued | CommandStatus::Processing)
            })
            .find_map(|r| r.envelope.external_id.clone())
    }

    /// Completed commands whose outcome has not yet been pushed to the WMS.
    pub fn completed_pending_wms(&self) -> Vec<CommandRecord> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|r| {
                        r.status == CommandStatus::Completed
                            && !r.wms_updated
                            && r.envelope.external_id.is_some()
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mark_wms_updated(&self, command_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(record) = entries.get_mut(command_id) {
                record.wms_updated = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_unix_millis, ShuttleCommand};

    fn envelope(id: &str, shuttle: &str, external: Option<&str>) -> CommandEnvelope {
        CommandEnvelope {
            id: id.to_string(),
            shuttle_id: shuttle.to_string(),
            command: ShuttleCommand::PalletIn,
            params: None,
            external_id: external.map(str::to_string),
            priority: 10,
            document_type: None,
            enqueued_at: now_unix_millis(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let registry = CommandRegistry::new();
        registry.insert(envelope("c1", "s1", None));
        assert_eq!(registry.status("c1"), Some(CommandStatus::Queued));

        registry.mark_processing("c1");
        assert_eq!(registry.status("c1"), Some(CommandStatus::Processing));

        registry.complete("c1", true);
        let record = registry.get("c1").unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let registry = CommandRegistry::new();
        registry.insert(envelope("c1", "s1", None));
        assert!(registry.mark_cancelled("c1"));
        assert!(registry.is_cancelled("c1"));

        registry.insert(envelope("c2", "s1", None));
        registry.mark_processing("c2");
        assert!(!registry.mark_cancelled("c2"));

        assert!(!registry.mark_cancelled("missing"));
    }

    #[test]
    fn test_active_external_id() {
        let registry = CommandRegistry::new();
        registry.insert(envelope("c1", "s1", Some("E1")));
        registry.insert(envelope("c2", "s2", Some("E2")));

        assert_eq!(registry.active_external_id("s1").as_deref(), Some("E1"));
        assert_eq!(registry.active_external_id("s3"), None);

        registry.complete("c1", true);
        assert_eq!(registry.active_external_id("s1"), None);
    }

    #[test]
    fn test_completed_pending_wms() {
        let registry = CommandRegistry::new();
        registry.insert(envelope("c1", "s1", Some("E1")));
        registry.insert(envelope("c2", "s1", None));
        registry.complete("c1", true);
        registry.complete("c2", true);

        // Only externally correlated completions are pushed
        let pending = registry.completed_pending_wms();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.id, "c1");

        registry.mark_wms_updated("c1");
        assert!(registry.completed_pending_wms().is_empty());
    }
}
