//! Gateway metrics
//!
//! Lightweight counters and gauges shared across components. The metrics
//! sink observes a JSON snapshot through the admin API; there is no
//! exporter wiring here.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters and gauges maintained by the gateway core.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Commands sent to shuttles, keyed by outcome label
    /// (`success`, `failure_busy`, `failure_bad_params`, ...).
    commands_sent: Mutex<HashMap<&'static str, u64>>,
    messages_received: AtomicU64,
    shuttle_errors: AtomicU64,
    webhook_delivered: AtomicU64,
    webhook_failures: AtomicU64,
    /// Live TCP connections from shuttles.
    active_connections: AtomicI64,
    /// Aggregate queued command count across all shuttles.
    queue_size: AtomicU64,
    /// Last reported battery percentage per shuttle.
    battery_levels: Mutex<HashMap<String, f64>>,
}

/// Point-in-time snapshot of all metrics, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub commands_sent: HashMap<&'static str, u64>,
    pub messages_received: u64,
    pub shuttle_errors: u64,
    pub webhook_delivered: u64,
    pub webhook_failures: u64,
    pub active_connections: i64,
    pub queue_size: u64,
    pub battery_levels: HashMap<String, f64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a command send attempt under an outcome label.
    pub fn record_command(&self, outcome: &'static str) {
        if let Ok(mut map) = self.commands_sent.lock() {
            *map.entry(outcome).or_insert(0) += 1;
        }
    }

    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_shuttle_errors(&self) {
        self.shuttle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_delivered(&self) {
        self.webhook_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_failures(&self) {
        self.webhook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, size: u64) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    pub fn set_battery_level(&self, shuttle_id: &str, percent: f64) {
        if let Ok(mut map) = self.battery_levels.lock() {
            map.insert(shuttle_id.to_string(), percent);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self
                .commands_sent
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            shuttle_errors: self.shuttle_errors.load(Ordering::Relaxed),
            webhook_delivered: self.webhook_delivered.load(Ordering::Relaxed),
            webhook_failures: self.webhook_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            battery_levels: self
                .battery_levels
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_outcomes_accumulate() {
        let metrics = GatewayMetrics::new();
        metrics.record_command("success");
        metrics.record_command("success");
        metrics.record_command("failure_busy");

        let snap = metrics.snapshot();
        assert_eq!(snap.commands_sent["success"], 2);
        assert_eq!(snap.commands_sent["failure_busy"], 1);
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = GatewayMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().active_connections, 1);
    }

    #[test]
    fn test_battery_gauge_overwrites() {
        let metrics = GatewayMetrics::new();
        metrics.set_battery_level("s1", 85.0);
        metrics.set_battery_level("s1", 19.0);
        let snap = metrics.snapshot();
        assert_eq!(snap.battery_levels["s1"], 19.0);
    }
}
