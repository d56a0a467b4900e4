//! WMS integration
//!
//! The WMS is polled for movement orders (shipments and transfers); each
//! order line carrying a shuttle command is resolved to an eligible FREE
//! shuttle via the stock mapping and pushed through the same submission
//! interface the admin API uses. Completed commands are reported back as
//! `done` line statuses.
//!
//! [`WmsBackend`] abstracts the vendor REST dialect so the poller can be
//! exercised against a mock in tests.

mod poller;

pub use poller::WmsPoller;

use crate::config::WmsSettings;
use crate::dispatch::retry::Retriable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

/// Per-request timeout against the WMS API.
const WMS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WMS API errors.
#[derive(Debug, thiserror::Error)]
pub enum WmsApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WMS returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("undecodable WMS response: {0}")]
    Decode(String),
}

impl Retriable for WmsApiError {
    fn is_retriable(&self) -> bool {
        // Transport problems and server-side hiccups may clear up; a body
        // we cannot decode will not.
        !matches!(self, WmsApiError::Decode(_))
    }
}

/// Kind of WMS document an order line originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Shipment,
    Transfer,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Shipment, DocumentKind::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Shipment => "shipment",
            DocumentKind::Transfer => "transfer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shipment" => Some(DocumentKind::Shipment),
            "transfer" => Some(DocumentKind::Transfer),
            _ => None,
        }
    }

    /// `IncomeApi` action listing documents changed within a period.
    fn period_action(&self) -> &'static str {
        match self {
            DocumentKind::Shipment => "IncomeApi.getShipmentStatusesPeriod",
            DocumentKind::Transfer => "IncomeApi.getTransferStatusesPeriod",
        }
    }

    /// Key of the line array inside a document body.
    fn lines_key(&self) -> &'static str {
        match self {
            DocumentKind::Shipment => "shipmentLine",
            DocumentKind::Transfer => "transferLine",
        }
    }

    /// Key of the quantity field in a `done` status update.
    fn quantity_key(&self) -> &'static str {
        match self {
            DocumentKind::Shipment => "quantityShipped",
            DocumentKind::Transfer => "quantityTransferred",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A document changed within the polled period.
#[derive(Debug, Clone)]
pub struct OrderHeader {
    pub external_id: String,
}

/// One line of a WMS document.
#[derive(Debug, Clone)]
pub struct OrderLine {
    pub external_id: String,
    pub shuttle_command: Option<String>,
    pub params: Option<String>,
}

/// Detail of a WMS document.
#[derive(Debug, Clone)]
pub struct OrderDetail {
    /// Warehouse (stock) name used to pick an eligible shuttle.
    pub warehouse: String,
    pub lines: Vec<OrderLine>,
}

/// Access to the WMS order API.
#[async_trait]
pub trait WmsBackend: Send + Sync {
    /// Documents of `kind` changed within `[since, until]`.
    async fn fetch_orders(
        &self,
        kind: DocumentKind,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<OrderHeader>, WmsApiError>;

    /// Full document body, `None` when the WMS no longer knows the id.
    async fn fetch_order_detail(
        &self,
        kind: DocumentKind,
        external_id: &str,
    ) -> Result<Option<OrderDetail>, WmsApiError>;

    /// Report a line status (`done`) back to the WMS.
    async fn push_line_status(
        &self,
        kind: DocumentKind,
        external_id: &str,
        status: &str,
    ) -> Result<(), WmsApiError>;
}

/// HTTP client for the WMS `IncomeApi` dialect.
pub struct HttpWmsBackend {
    http: reqwest::Client,
    settings: WmsSettings,
}

impl HttpWmsBackend {
    pub fn new(settings: WmsSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WMS_REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self { http, settings }
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    async fn get_json(&self, url: &str) -> Result<Value, WmsApiError> {
        debug!(url, "WMS request");
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WmsApiError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| WmsApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WmsBackend for HttpWmsBackend {
    async fn fetch_orders(
        &self,
        kind: DocumentKind,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<OrderHeader>, WmsApiError> {
        let url = format!(
            "{}/exec?action={}&p={}&p={}",
            self.base_url(),
            kind.period_action(),
            since.format("%Y-%m-%dT%H:%M:%S"),
            until.format("%Y-%m-%dT%H:%M:%S"),
        );
        let body = self.get_json(&url).await?;

        let mut orders = Vec::new();
        if let Some(items) = body.get(kind.as_str()).and_then(Value::as_array) {
            for item in items {
                if let Some(id) = item.get("externalId").and_then(Value::as_str) {
                    orders.push(OrderHeader {
                        external_id: id.to_string(),
                    });
                }
            }
        }
        Ok(orders)
    }

    async fn fetch_order_detail(
        &self,
        kind: DocumentKind,
        external_id: &str,
    ) -> Result<Option<OrderDetail>, WmsApiError> {
        let url = format!(
            "{}/exec?action=IncomeApi.getObject&p={}&p={}",
            self.base_url(),
            kind.as_str(),
            external_id,
        );
        let body = self.get_json(&url).await?;

        let Some(document) = body
            .get(kind.as_str())
            .and_then(Value::as_array)
            .and_then(|docs| docs.first())
        else {
            return Ok(None);
        };

        let warehouse = document
            .get("warehouse")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let lines = document
            .get(kind.lines_key())
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|line| {
                        let external_id = line.get("externalId").and_then(Value::as_str)?;
                        Some(OrderLine {
                            external_id: external_id.to_string(),
                            shuttle_command: line
                                .get("shuttleCommand")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            params: line
                                .get("params")
                                .and_then(Value::as_str)
                                .filter(|p| !p.is_empty())
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(OrderDetail { warehouse, lines }))
    }

    async fn push_line_status(
        &self,
        kind: DocumentKind,
        external_id: &str,
        status: &str,
    ) -> Result<(), WmsApiError> {
        let url = format!("{}/exec?action=IncomeApi.insertUpdate", self.base_url());
        let body = serde_json::json!({
            kind.as_str(): [{
                "externalId": external_id,
                kind.lines_key(): [{
                    "externalId": external_id,
                    kind.quantity_key(): 1,
                    "status": status,
                }],
            }],
        });

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .json(&body)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            error!(status = %resp.status(), external_id, "WMS rejected status update");
            Err(WmsApiError::Status(resp.status()))
        }
    }
}
