//! Heartbeat monitor
//!
//! Periodically inspects every shuttle. A shuttle silent for more than
//! twice the heartbeat interval, or sitting in `ERROR`, joins the failed
//! set and gets a bypass `STATUS` probe through the retry helper. A
//! successful send clears the error code and resets the status to
//! `UNKNOWN`; the shuttle's real status arrives through the inbound
//! listener.

use crate::config::Settings;
use crate::dispatch::retry::{retry_with_backoff, RetryPolicy};
use crate::store::StateStore;
use crate::transport;
use crate::types::{now_unix_secs, ShuttleCommand, ShuttleStatus};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Liveness monitor for the shuttle fleet.
pub struct HeartbeatMonitor {
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    failed: Mutex<HashSet<String>>,
    probe_policy: RetryPolicy,
}

impl HeartbeatMonitor {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn StateStore>) -> Self {
        Self {
            settings,
            store,
            failed: Mutex::new(HashSet::new()),
            probe_policy: RetryPolicy::heartbeat(),
        }
    }

    /// Override the probe retry policy (tests).
    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    /// Monitor loop; one sweep per heartbeat interval.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.heartbeat_interval.as_secs(),
            "Heartbeat monitor started"
        );
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick so the fleet gets a grace period
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Heartbeat monitor stopping");
                    return;
                }
                _ = interval.tick() => self.check_all().await,
            }
        }
    }

    /// One sweep over the fleet.
    pub async fn check_all(&self) {
        let now = now_unix_secs();
        let stale_after = self.settings.heartbeat_interval.as_secs() * 2;

        for shuttle_id in self.settings.shuttles.keys() {
            let state = match self.store.get(shuttle_id) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    error!(shuttle_id, error = %e, "Heartbeat could not read state");
                    continue;
                }
            };

            let silent_secs = now.saturating_sub(state.last_seen);
            let failing = silent_secs > stale_after || state.status == ShuttleStatus::Error;

            if failing {
                let newly_failed = self
                    .failed
                    .lock()
                    .map(|mut set| set.insert(shuttle_id.clone()))
                    .unwrap_or(false);
                if newly_failed {
                    warn!(
                        shuttle_id,
                        silent_secs,
                        status = %state.status,
                        "Shuttle unresponsive or errored, probing"
                    );
                }
                self.probe(shuttle_id).await;
            } else {
                let recovered = self
                    .failed
                    .lock()
                    .map(|mut set| set.remove(shuttle_id))
                    .unwrap_or(false);
                if recovered {
                    info!(shuttle_id, "Shuttle active again");
                }
            }
        }
    }

    /// Send a bypass STATUS probe; a successful send clears the failure
    /// markers and leaves the real status to the inbound listener.
    async fn probe(&self, shuttle_id: &str) {
        let Some(endpoint) = self.settings.endpoint(shuttle_id) else {
            return;
        };

        let frame = format!("{}\n", ShuttleCommand::Status.wire_token());
        let result = retry_with_backoff(self.probe_policy, "heartbeat_status", || {
            transport::send_line(
                endpoint,
                &frame,
                self.settings.tcp_connect_timeout,
                self.settings.tcp_write_timeout,
            )
        })
        .await;

        match result {
            Ok(()) => {
                info!(shuttle_id, "Heartbeat probe delivered, awaiting status report");
                let update = self.store.update(shuttle_id, &mut |state| {
                    state.status = ShuttleStatus::Unknown;
                    state.error_code = None;
                });
                if let Err(e) = update {
                    error!(shuttle_id, error = %e, "Failed to reset probed shuttle state");
                    return;
                }
                if let Ok(mut set) = self.failed.lock() {
                    set.remove(shuttle_id);
                }
            }
            Err(e) => {
                warn!(shuttle_id, error = %e, "Heartbeat probe failed");
            }
        }
    }

    /// Shuttles currently considered failing.
    pub fn failed_shuttles(&self) -> Vec<String> {
        self.failed
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
