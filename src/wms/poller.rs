//! WMS poll loop
//!
//! Periodically fetches shipment and transfer orders from the WMS, submits
//! each shuttle-command line to the dispatcher, and pushes `done` statuses
//! for completed commands back to the WMS. Poller failures are logged and
//! retried on the next cycle; they never touch the shuttle-facing paths.

use super::{DocumentKind, OrderHeader, WmsBackend};
use crate::config::Settings;
use crate::dispatch::retry::{retry_with_backoff, RetryPolicy};
use crate::dispatch::{CommandRegistry, Dispatcher, SubmitRequest};
use crate::store::StateStore;
use crate::types::{ShuttleCommand, ShuttleStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// WMS order intake and status push-back.
pub struct WmsPoller {
    backend: Arc<dyn WmsBackend>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CommandRegistry>,
    store: Arc<dyn StateStore>,
    settings: Arc<Settings>,
    /// Line ids already turned into commands.
    processed: Mutex<HashSet<String>>,
    last_poll: Mutex<DateTime<Utc>>,
    api_retry: RetryPolicy,
}

impl WmsPoller {
    pub fn new(
        backend: Arc<dyn WmsBackend>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn StateStore>,
        settings: Arc<Settings>,
    ) -> Self {
        let registry = dispatcher.registry();
        Self {
            backend,
            dispatcher,
            registry,
            store,
            settings,
            processed: Mutex::new(HashSet::new()),
            // Catch up on recent orders after a restart
            last_poll: Mutex::new(Utc::now() - ChronoDuration::minutes(30)),
            api_retry: RetryPolicy::default(),
        }
    }

    /// Override the API retry policy (tests).
    pub fn with_api_retry(mut self, policy: RetryPolicy) -> Self {
        self.api_retry = policy;
        self
    }

    /// Poll loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self
            .settings
            .wms
            .as_ref()
            .map_or(30, |wms| wms.poll_interval_secs);
        info!(interval_secs = period, "WMS poller started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(period.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("WMS poller stopping");
                    return;
                }
                _ = interval.tick() => self.poll_once().await,
            }
        }
    }

    /// One full poll cycle: intake then status push-back.
    pub async fn poll_once(&self) {
        let since = self
            .last_poll
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Utc::now());
        let until = Utc::now();

        for kind in DocumentKind::ALL {
            match self.backend.fetch_orders(kind, since, until).await {
                Ok(orders) => {
                    if !orders.is_empty() {
                        info!(kind = %kind, count = orders.len(), "WMS orders fetched");
                    }
                    self.process_orders(kind, orders).await;
                }
                Err(e) => error!(kind = %kind, error = %e, "Failed to fetch WMS orders"),
            }
        }

        self.push_completed_statuses().await;

        if let Ok(mut last) = self.last_poll.lock() {
            *last = until;
        }
    }

    /// Turn fetched order lines into dispatched commands.
    async fn process_orders(&self, kind: DocumentKind, orders: Vec<OrderHeader>) {
        for header in orders {
            let detail = match retry_with_backoff(self.api_retry, "wms_get_object", || {
                self.backend.fetch_order_detail(kind, &header.external_id)
            })
            .await
            {
                Ok(Some(detail)) => detail,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        external_id = %header.external_id,
                        error = %e,
                        "Could not fetch order detail"
                    );
                    continue;
                }
            };

            for line in detail.lines {
                let already_processed = self
                    .processed
                    .lock()
                    .map(|set| set.contains(&line.external_id))
                    .unwrap_or(false);
                if already_processed {
                    continue;
                }

                let Some(token) = line.shuttle_command.as_deref() else {
                    continue;
                };
                let Some(command) = ShuttleCommand::from_wire_token(token) else {
                    debug!(token, "Order line carries no known shuttle command");
                    continue;
                };

                let Some(shuttle_id) = self.pick_free_shuttle(&detail.warehouse) else {
                    // Left unprocessed: retried on the next cycle once a
                    // shuttle frees up.
                    warn!(
                        stock = %detail.warehouse,
                        command = %command,
                        "No free shuttle for WMS order line"
                    );
                    continue;
                };

                let request = SubmitRequest {
                    shuttle_id: shuttle_id.clone(),
                    command,
                    params: line.params.clone(),
                    external_id: Some(line.external_id.clone()),
                    priority: Some(if command == ShuttleCommand::Home { 5 } else { 10 }),
                    document_type: Some(kind.as_str().to_string()),
                };

                match self.dispatcher.submit(request).await {
                    Ok(_) => {
                        info!(
                            shuttle_id = %shuttle_id,
                            command = %command,
                            external_id = %line.external_id,
                            kind = %kind,
                            "WMS order line dispatched"
                        );
                        if let Ok(mut set) = self.processed.lock() {
                            set.insert(line.external_id.clone());
                        }
                    }
                    Err(e) => {
                        error!(
                            shuttle_id = %shuttle_id,
                            command = %command,
                            error = %e,
                            "Failed to dispatch WMS order line"
                        );
                    }
                }
            }
        }
    }

    /// First FREE shuttle eligible for a stock, in mapping order.
    fn pick_free_shuttle(&self, stock: &str) -> Option<String> {
        for shuttle_id in self.settings.eligible_shuttles(stock) {
            match self.store.get(&shuttle_id) {
                Ok(Some(state)) if state.status == ShuttleStatus::Free => {
                    return Some(shuttle_id)
                }
                Ok(_) => {}
                Err(e) => warn!(shuttle_id, error = %e, "Could not read shuttle state"),
            }
        }
        None
    }

    /// Report completed, externally correlated commands back to the WMS.
    async fn push_completed_statuses(&self) {
        for record in self.registry.completed_pending_wms() {
            let Some(external_id) = record.envelope.external_id.clone() else {
                continue;
            };
            let kind = record
                .envelope
                .document_type
                .as_deref()
                .and_then(DocumentKind::parse)
                .unwrap_or(DocumentKind::Shipment);

            let result = retry_with_backoff(self.api_retry, "wms_update_status", || {
                self.backend.push_line_status(kind, &external_id, "done")
            })
            .await;

            match result {
                Ok(()) => {
                    info!(
                        external_id = %external_id,
                        kind = %kind,
                        command_id = %record.envelope.id,
                        "Completion reported to WMS"
                    );
                    self.registry.mark_wms_updated(&record.envelope.id);
                }
                Err(e) => {
                    error!(
                        external_id = %external_id,
                        error = %e,
                        "Failed to report completion to WMS"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShuttleEndpoint;
    use crate::dispatch::RetryPolicy;
    use crate::store::MemoryStateStore;
    use crate::types::{now_unix_millis, CommandEnvelope};
    use crate::wms::{OrderDetail, OrderLine, WmsApiError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct MockBackend {
        orders: Vec<OrderHeader>,
        detail: OrderDetail,
        pushes: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl WmsBackend for MockBackend {
        async fn fetch_orders(
            &self,
            kind: DocumentKind,
            _since: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Result<Vec<OrderHeader>, WmsApiError> {
            if kind == DocumentKind::Shipment {
                Ok(self.orders.clone())
            } else {
                Ok(Vec::new())
            }
        }

        async fn fetch_order_detail(
            &self,
            _kind: DocumentKind,
            _external_id: &str,
        ) -> Result<Option<OrderDetail>, WmsApiError> {
            Ok(Some(self.detail.clone()))
        }

        async fn push_line_status(
            &self,
            _kind: DocumentKind,
            external_id: &str,
            status: &str,
        ) -> Result<(), WmsApiError> {
            self.pushes
                .lock()
                .unwrap()
                .push((external_id.to_string(), status.to_string()));
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    fn poller_with(
        backend: MockBackend,
    ) -> (Arc<WmsPoller>, Arc<Dispatcher>, Arc<dyn StateStore>) {
        let mut shuttles = HashMap::new();
        shuttles.insert(
            "s1".to_string(),
            ShuttleEndpoint {
                host: "127.0.0.1".to_string(),
                command_port: 1,
            },
        );
        let settings = Settings::with_shuttles(shuttles);
        let mut stocks = HashMap::new();
        stocks.insert("main".to_string(), vec!["s1".to_string()]);
        settings.seed_stocks(stocks);
        let settings = Arc::new(settings);

        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store.init_if_absent("s1").unwrap();
        store
            .update("s1", &mut |s| s.status = ShuttleStatus::Free)
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&settings),
            Arc::clone(&store),
            Arc::new(CommandRegistry::new()),
            Arc::new(crate::metrics::GatewayMetrics::new()),
            fast_retry(),
        ));

        let poller = Arc::new(
            WmsPoller::new(
                Arc::new(backend),
                Arc::clone(&dispatcher),
                Arc::clone(&store),
                settings,
            )
            .with_api_retry(fast_retry()),
        );
        (poller, dispatcher, store)
    }

    fn shipment_backend() -> MockBackend {
        MockBackend {
            orders: vec![OrderHeader {
                external_id: "DOC-1".to_string(),
            }],
            detail: OrderDetail {
                warehouse: "main".to_string(),
                lines: vec![OrderLine {
                    external_id: "E1".to_string(),
                    shuttle_command: Some("PALLET_IN".to_string()),
                    params: None,
                }],
            },
            pushes: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_order_line_dispatched_once() {
        let (poller, dispatcher, _store) = poller_with(shipment_backend());

        poller.poll_once().await;
        assert_eq!(dispatcher.queued_for("s1"), 1);

        // Second cycle must not duplicate the command
        poller.poll_once().await;
        assert_eq!(dispatcher.queued_for("s1"), 1);
    }

    #[tokio::test]
    async fn test_no_free_shuttle_leaves_line_pending() {
        let (poller, dispatcher, store) = poller_with(shipment_backend());
        store
            .update("s1", &mut |s| s.status = ShuttleStatus::Busy)
            .unwrap();

        poller.poll_once().await;
        assert_eq!(dispatcher.queued_for("s1"), 0);

        // Shuttle frees up: the same line goes through on the next cycle
        store
            .update("s1", &mut |s| s.status = ShuttleStatus::Free)
            .unwrap();
        poller.poll_once().await;
        assert_eq!(dispatcher.queued_for("s1"), 1);
    }

    #[tokio::test]
    async fn test_completed_commands_pushed_back() {
        let (poller, dispatcher, _store) = poller_with(MockBackend {
            orders: Vec::new(),
            detail: OrderDetail {
                warehouse: "main".to_string(),
                lines: Vec::new(),
            },
            pushes: Mutex::new(Vec::new()),
        });

        let registry = dispatcher.registry();
        registry.insert(CommandEnvelope {
            id: "c1".to_string(),
            shuttle_id: "s1".to_string(),
            command: ShuttleCommand::PalletOut,
            params: None,
            external_id: Some("E9".to_string()),
            priority: 5,
            document_type: Some("transfer".to_string()),
            enqueued_at: now_unix_millis(),
        });
        registry.complete("c1", true);

        poller.poll_once().await;

        assert!(registry.completed_pending_wms().is_empty());
        assert!(registry.get("c1").unwrap().wms_updated);
    }
}
