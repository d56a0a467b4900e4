//! Shuttle message interpreter
//!
//! Parses shuttle-originated protocol lines into a state-update record and,
//! when applicable, a state-machine trigger. The parse itself is pure; the
//! [`MessageInterpreter::apply`] path reads the current record, runs the
//! transition, writes the result through the state store's CAS update and
//! hands the event to the webhook reporter.

use crate::metrics::GatewayMetrics;
use crate::state_machine::StateMachine;
use crate::store::{StateStore, StoreError};
use crate::types::{ShuttleStatus, Trigger};
use crate::webhook::WebhookReporter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parsed effect of one shuttle line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineEffect {
    /// Direct status override (e.g. from `STATUS=`), applied before any
    /// trigger-driven transition.
    pub status: Option<ShuttleStatus>,
    pub trigger: Option<Trigger>,
    pub error_code: Option<String>,
    pub location_data: Option<String>,
    pub pallet_count_data: Option<String>,
    pub battery_level: Option<String>,
    /// Battery percentage parsed for the gauge.
    pub battery_percent: Option<f64>,
    pub wdh_hours: Option<i64>,
    pub wlh_hours: Option<i64>,
    pub clear_current_command: bool,
}

/// Map an `<OP>_STARTED` report to its command trigger.
fn started_trigger(message: &str) -> Option<Trigger> {
    // PALLET_IN is checked before STACK_IN etc. so the most specific
    // token wins; HOME last since it never collides.
    if message.contains("PALLET_IN") {
        Some(Trigger::PalletIn)
    } else if message.contains("PALLET_OUT") {
        Some(Trigger::PalletOut)
    } else if message.contains("FIFO") {
        Some(Trigger::Fifo)
    } else if message.contains("FILO") {
        Some(Trigger::Filo)
    } else if message.contains("STACK_IN") {
        Some(Trigger::StackIn)
    } else if message.contains("STACK_OUT") {
        Some(Trigger::StackOut)
    } else if message.contains("HOME") {
        Some(Trigger::Home)
    } else {
        None
    }
}

/// Map a `STATUS=` value to an operational status. Unknown values are
/// reported as `UNKNOWN` rather than dropped.
fn map_reported_status(value: &str) -> ShuttleStatus {
    match value {
        "FREE" => ShuttleStatus::Free,
        // Cargo on board means the shuttle is occupied
        "CARGO" | "BUSY" => ShuttleStatus::Busy,
        "NOT_READY" => ShuttleStatus::NotReady,
        "MOVING" => ShuttleStatus::Moving,
        "LOADING" => ShuttleStatus::Loading,
        "UNLOADING" => ShuttleStatus::Unloading,
        "CHARGING" => ShuttleStatus::Charging,
        "LOW_BATTERY" => ShuttleStatus::LowBattery,
        _ => ShuttleStatus::Unknown,
    }
}

/// Parse one shuttle line. `low_battery_threshold` is the percentage below
/// which the `BATTERY_LOW` trigger fires.
pub fn interpret_line(message: &str, low_battery_threshold: f64) -> LineEffect {
    let mut effect = LineEffect::default();

    if message.ends_with("_STARTED") {
        match started_trigger(message) {
            Some(trigger) => effect.trigger = Some(trigger),
            // Unrecognised operation: the shuttle is occupied by something
            None => effect.status = Some(ShuttleStatus::Busy),
        }
    } else if message.ends_with("_DONE") {
        effect.trigger = Some(Trigger::Done);
    } else if message.ends_with("_ABORT") {
        effect.error_code = Some(message.to_string());
        effect.trigger = Some(Trigger::Error);
    }

    if let Some(value) = message.strip_prefix("LOCATION=") {
        effect.location_data = Some(value.to_string());
        // A location report closes the pending COUNT/locate task
        effect.trigger = Some(Trigger::Done);
        effect.clear_current_command = true;
    } else if message.starts_with("COUNT_") && message.contains('=') {
        effect.pallet_count_data = Some(message.to_string());
        effect.trigger = Some(Trigger::Done);
        effect.clear_current_command = true;
    } else if let Some(value) = message.strip_prefix("STATUS=") {
        let status = map_reported_status(value.trim().to_uppercase().as_str());
        effect.status = Some(status);
        if matches!(
            status,
            ShuttleStatus::Free | ShuttleStatus::NotReady | ShuttleStatus::Unknown
        ) {
            effect.clear_current_command = true;
        }
    } else if let Some(value) = message.strip_prefix("BATTERY=") {
        effect.battery_level = Some(value.to_string());
        // Tolerate "<20%" style readings from older firmware
        let cleaned = value.replace('%', "");
        match cleaned.trim_start_matches('<').trim().parse::<f64>() {
            Ok(percent) => {
                effect.battery_percent = Some(percent);
                if percent < low_battery_threshold {
                    effect.trigger = Some(Trigger::BatteryLow);
                }
            }
            Err(_) => warn!(value, "Unparseable battery level"),
        }
    } else if let Some(value) = message.strip_prefix("WDH=") {
        match value.trim().parse::<i64>() {
            Ok(hours) => effect.wdh_hours = Some(hours),
            Err(_) => warn!(value, "Unparseable WDH value"),
        }
    } else if let Some(value) = message.strip_prefix("WLH=") {
        match value.trim().parse::<i64>() {
            Ok(hours) => effect.wlh_hours = Some(hours),
            Err(_) => warn!(value, "Unparseable WLH value"),
        }
    } else if message.starts_with("F_CODE=") {
        effect.error_code = Some(message.to_string());
        effect.trigger = Some(Trigger::Error);
        effect.clear_current_command = true;
    }

    effect
}

/// Applies interpreted shuttle lines to the state store and reports the
/// resulting events to the WMS.
pub struct MessageInterpreter {
    store: Arc<dyn StateStore>,
    machine: Arc<StateMachine>,
    webhook: Arc<WebhookReporter>,
    metrics: Arc<GatewayMetrics>,
    low_battery_threshold: f64,
}

impl MessageInterpreter {
    pub fn new(
        store: Arc<dyn StateStore>,
        machine: Arc<StateMachine>,
        webhook: Arc<WebhookReporter>,
        metrics: Arc<GatewayMetrics>,
        low_battery_threshold: f64,
    ) -> Self {
        Self {
            store,
            machine,
            webhook,
            metrics,
            low_battery_threshold,
        }
    }

    /// Process one inbound line for a shuttle.
    pub async fn apply(&self, shuttle_id: &str, message: &str) -> Result<(), StoreError> {
        let Some(current) = self.store.get(shuttle_id)? else {
            return Err(StoreError::NotFound(shuttle_id.to_string()));
        };

        self.metrics.inc_messages_received();

        let mut effect = interpret_line(message, self.low_battery_threshold);

        if let Some(percent) = effect.battery_percent {
            self.metrics.set_battery_level(shuttle_id, percent);
        }
        if message.starts_with("F_CODE=") {
            self.metrics.inc_shuttle_errors();
        }

        let mut final_status = effect.status;
        let mut clear_external_id = false;
        if let Some(trigger) = effect.trigger {
            if let Some(next) = self
                .machine
                .try_transition(shuttle_id, current.status, trigger)
                .await
            {
                final_status = Some(next);
                // Terminal transition: the owning command is finished
                if next == ShuttleStatus::Free
                    && matches!(trigger, Trigger::Done | Trigger::Charged | Trigger::Reset)
                {
                    effect.clear_current_command = true;
                    clear_external_id = true;
                }
            }
        }

        let message_owned = message.to_string();
        let updated = self.store.update(shuttle_id, &mut |state| {
            state.last_message_sent_to_wms = Some(message_owned.clone());
            if let Some(status) = final_status {
                state.status = status;
            }
            if let Some(code) = effect.error_code.clone() {
                state.error_code = Some(code);
            }
            if let Some(location) = effect.location_data.clone() {
                state.location_data = Some(location);
            }
            if let Some(count) = effect.pallet_count_data.clone() {
                state.pallet_count_data = Some(count);
            }
            if let Some(level) = effect.battery_level.clone() {
                state.battery_level = Some(level);
            }
            if let Some(hours) = effect.wdh_hours {
                state.wdh_hours = Some(hours);
            }
            if let Some(hours) = effect.wlh_hours {
                state.wlh_hours = Some(hours);
            }
            if effect.clear_current_command {
                state.current_command = None;
            }
            if clear_external_id {
                state.external_id = None;
            }
        })?;

        debug!(
            shuttle_id,
            message,
            status = %updated.status,
            "Shuttle message applied"
        );

        // Correlate with the external id the command carried before any
        // terminal transition cleared it.
        self.webhook.report(
            shuttle_id,
            message,
            updated.status,
            updated.error_code.clone(),
            current.external_id,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::registry::CommandRegistry;
    use crate::store::MemoryStateStore;

    fn interpreter_with_store() -> (MessageInterpreter, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let webhook = Arc::new(WebhookReporter::new(
            None,
            Arc::new(CommandRegistry::new()),
            Arc::clone(&metrics),
        ));
        let interp = MessageInterpreter::new(
            Arc::clone(&store),
            Arc::new(StateMachine::new()),
            webhook,
            metrics,
            20.0,
        );
        (interp, store)
    }

    fn set_status(store: &Arc<dyn StateStore>, id: &str, status: ShuttleStatus) {
        store.init_if_absent(id).unwrap();
        store.update(id, &mut |s| s.status = status).unwrap();
    }

    #[test]
    fn test_interpret_started_lines() {
        let eff = interpret_line("PALLET_IN_STARTED", 20.0);
        assert_eq!(eff.trigger, Some(Trigger::PalletIn));
        assert_eq!(interpret_line("STACK_OUT_STARTED", 20.0).trigger, Some(Trigger::StackOut));
        assert_eq!(interpret_line("FIFO_STARTED", 20.0).trigger, Some(Trigger::Fifo));
        assert_eq!(interpret_line("HOME_STARTED", 20.0).trigger, Some(Trigger::Home));

        // Unrecognised operation falls back to a plain BUSY marker
        let eff = interpret_line("DEFRAG_STARTED", 20.0);
        assert_eq!(eff.trigger, None);
        assert_eq!(eff.status, Some(ShuttleStatus::Busy));
    }

    #[test]
    fn test_interpret_done_and_abort() {
        assert_eq!(interpret_line("PALLET_IN_DONE", 20.0).trigger, Some(Trigger::Done));

        let eff = interpret_line("PALLET_OUT_ABORT", 20.0);
        assert_eq!(eff.trigger, Some(Trigger::Error));
        assert_eq!(eff.error_code.as_deref(), Some("PALLET_OUT_ABORT"));
    }

    #[test]
    fn test_interpret_location_and_count() {
        let eff = interpret_line("LOCATION=A-03-2", 20.0);
        assert_eq!(eff.location_data.as_deref(), Some("A-03-2"));
        assert_eq!(eff.trigger, Some(Trigger::Done));
        assert!(eff.clear_current_command);

        let eff = interpret_line("COUNT_PALLETS=14", 20.0);
        assert_eq!(eff.pallet_count_data.as_deref(), Some("COUNT_PALLETS=14"));
        assert_eq!(eff.trigger, Some(Trigger::Done));
        assert!(eff.clear_current_command);
    }

    #[test]
    fn test_interpret_status_map() {
        let eff = interpret_line("STATUS=FREE", 20.0);
        assert_eq!(eff.status, Some(ShuttleStatus::Free));
        assert!(eff.clear_current_command);

        let eff = interpret_line("STATUS=CARGO", 20.0);
        assert_eq!(eff.status, Some(ShuttleStatus::Busy));
        assert!(!eff.clear_current_command);

        assert_eq!(
            interpret_line("STATUS=LOW_BATTERY", 20.0).status,
            Some(ShuttleStatus::LowBattery)
        );

        let eff = interpret_line("STATUS=WAT", 20.0);
        assert_eq!(eff.status, Some(ShuttleStatus::Unknown));
        assert!(eff.clear_current_command);
    }

    #[test]
    fn test_interpret_battery() {
        let eff = interpret_line("BATTERY=85%", 20.0);
        assert_eq!(eff.battery_percent, Some(85.0));
        assert_eq!(eff.trigger, None);

        // "<19%" readings parse and trip the low-battery trigger
        let eff = interpret_line("BATTERY=<19%", 20.0);
        assert_eq!(eff.battery_percent, Some(19.0));
        assert_eq!(eff.trigger, Some(Trigger::BatteryLow));

        let eff = interpret_line("BATTERY=???", 20.0);
        assert_eq!(eff.battery_percent, None);
        assert_eq!(eff.trigger, None);
    }

    #[test]
    fn test_interpret_counters_and_fcode() {
        assert_eq!(interpret_line("WDH=1200", 20.0).wdh_hours, Some(1200));
        assert_eq!(interpret_line("WLH=340", 20.0).wlh_hours, Some(340));
        assert_eq!(interpret_line("WDH=abc", 20.0).wdh_hours, None);

        let eff = interpret_line("F_CODE=17", 20.0);
        assert_eq!(eff.error_code.as_deref(), Some("F_CODE=17"));
        assert_eq!(eff.trigger, Some(Trigger::Error));
        assert!(eff.clear_current_command);
    }

    #[tokio::test]
    async fn test_apply_started_then_done() {
        let (interp, store) = interpreter_with_store();
        set_status(&store, "s1", ShuttleStatus::Free);
        store
            .update("s1", &mut |s| {
                s.current_command = Some("PALLET_IN".to_string());
                s.external_id = Some("E1".to_string());
            })
            .unwrap();

        interp.apply("s1", "PALLET_IN_STARTED").await.unwrap();
        let state = store.get("s1").unwrap().unwrap();
        assert_eq!(state.status, ShuttleStatus::Loading);
        assert_eq!(state.current_command.as_deref(), Some("PALLET_IN"));

        interp.apply("s1", "PALLET_IN_DONE").await.unwrap();
        let state = store.get("s1").unwrap().unwrap();
        assert_eq!(state.status, ShuttleStatus::Free);
        assert_eq!(state.current_command, None);
        assert_eq!(state.external_id, None);
        assert_eq!(
            state.last_message_sent_to_wms.as_deref(),
            Some("PALLET_IN_DONE")
        );
    }

    #[tokio::test]
    async fn test_apply_status_free_is_idempotent() {
        let (interp, store) = interpreter_with_store();
        set_status(&store, "s1", ShuttleStatus::Busy);
        store
            .update("s1", &mut |s| s.current_command = Some("PALLET_IN".to_string()))
            .unwrap();

        interp.apply("s1", "STATUS=FREE").await.unwrap();
        let first = store.get("s1").unwrap().unwrap();
        assert_eq!(first.status, ShuttleStatus::Free);
        assert_eq!(first.current_command, None);

        interp.apply("s1", "STATUS=FREE").await.unwrap();
        let second = store.get("s1").unwrap().unwrap();
        assert_eq!(second.status, ShuttleStatus::Free);
        assert_eq!(second.current_command, None);
    }

    #[tokio::test]
    async fn test_apply_illegal_trigger_preserves_status() {
        let (interp, store) = interpreter_with_store();
        set_status(&store, "s1", ShuttleStatus::Free);

        // DONE from FREE is not a legal transition
        interp.apply("s1", "PALLET_IN_DONE").await.unwrap();
        let state = store.get("s1").unwrap().unwrap();
        assert_eq!(state.status, ShuttleStatus::Free);
    }

    #[tokio::test]
    async fn test_apply_fcode_sets_error() {
        let (interp, store) = interpreter_with_store();
        set_status(&store, "s1", ShuttleStatus::Loading);
        store
            .update("s1", &mut |s| s.current_command = Some("PALLET_IN".to_string()))
            .unwrap();

        interp.apply("s1", "F_CODE=17").await.unwrap();
        let state = store.get("s1").unwrap().unwrap();
        assert_eq!(state.status, ShuttleStatus::Error);
        assert_eq!(state.error_code.as_deref(), Some("F_CODE=17"));
        assert_eq!(state.current_command, None);
    }

    #[tokio::test]
    async fn test_apply_unknown_shuttle() {
        let (interp, _store) = interpreter_with_store();
        assert!(matches!(
            interp.apply("ghost", "STATUS=FREE").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_refreshes_last_seen() {
        let (interp, store) = interpreter_with_store();
        set_status(&store, "s1", ShuttleStatus::Free);
        let before = store.get("s1").unwrap().unwrap().last_seen;

        interp.apply("s1", "BATTERY=90%").await.unwrap();
        let after = store.get("s1").unwrap().unwrap().last_seen;
        assert!(after >= before);
    }
}
