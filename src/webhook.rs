//! WMS webhook reporter
//!
//! Translates shuttle messages and their resulting state into outbound
//! notifications for the WMS. Dispatch is fire-and-forget from the inbound
//! path: delivery failures are logged and counted, never retried
//! synchronously and never allowed to block message processing.

use crate::dispatch::registry::CommandRegistry;
use crate::metrics::GatewayMetrics;
use crate::types::ShuttleStatus;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-request delivery timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WMS returned status {0}")]
    Status(reqwest::StatusCode),
}

/// JSON body posted to the WMS endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub shuttle_id: String,
    pub message: String,
    pub status: ShuttleStatus,
    pub error_code: Option<String>,
    pub external_id: Option<String>,
    /// Unix seconds with millisecond precision.
    pub timestamp: f64,
}

/// Posts shuttle events to the configured WMS endpoint.
pub struct WebhookReporter {
    http: reqwest::Client,
    url: Option<String>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl WebhookReporter {
    pub fn new(
        url: Option<String>,
        registry: Arc<CommandRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        if url.is_none() {
            info!("No WMS webhook URL configured — event reporting disabled");
        }

        Self {
            http,
            url,
            registry,
            metrics,
        }
    }

    /// Fire-and-forget dispatch from the inbound path.
    pub fn report(
        self: &Arc<Self>,
        shuttle_id: &str,
        message: &str,
        status: ShuttleStatus,
        error_code: Option<String>,
        external_id: Option<String>,
    ) {
        if self.url.is_none() {
            debug!(shuttle_id, "Webhook disabled, skipping report");
            return;
        }

        // Fall back to the registry when the state record has no owner id.
        let external_id =
            external_id.or_else(|| self.registry.active_external_id(shuttle_id));

        let payload = WebhookPayload {
            shuttle_id: shuttle_id.to_string(),
            message: message.to_string(),
            status,
            error_code,
            external_id,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };

        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            match reporter.deliver(&payload).await {
                Ok(()) => {
                    reporter.metrics.inc_webhook_delivered();
                    info!(
                        shuttle_id = %payload.shuttle_id,
                        message = %payload.message,
                        "Webhook delivered to WMS"
                    );
                }
                Err(e) => {
                    reporter.metrics.inc_webhook_failures();
                    error!(
                        shuttle_id = %payload.shuttle_id,
                        message = %payload.message,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            }
        });
    }

    /// Deliver one payload; 2xx counts as success.
    pub async fn deliver(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let Some(url) = &self.url else {
            return Ok(());
        };

        let resp = self.http.post(url).json(payload).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            warn!(status = %resp.status(), "WMS webhook rejected payload");
            Err(WebhookError::Status(resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(url: Option<String>) -> Arc<WebhookReporter> {
        Arc::new(WebhookReporter::new(
            url,
            Arc::new(CommandRegistry::new()),
            Arc::new(GatewayMetrics::new()),
        ))
    }

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload {
            shuttle_id: "s1".to_string(),
            message: "PALLET_IN_DONE".to_string(),
            status: ShuttleStatus::Free,
            error_code: None,
            external_id: Some("E1".to_string()),
            timestamp: 1_700_000_000.5,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["shuttle_id"], "s1");
        assert_eq!(json["status"], "FREE");
        assert_eq!(json["external_id"], "E1");
        assert!(json["error_code"].is_null());
        assert!(json.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_deliver_without_url_is_noop() {
        let reporter = reporter(None);
        let payload = WebhookPayload {
            shuttle_id: "s1".to_string(),
            message: "STATUS=FREE".to_string(),
            status: ShuttleStatus::Free,
            error_code: None,
            external_id: None,
            timestamp: 0.0,
        };
        reporter.deliver(&payload).await.unwrap();
    }
}
