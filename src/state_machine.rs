//! Operational state machine
//!
//! A pure transition table over `(status, trigger)` with a default-reject
//! policy: pairs not listed leave the current status untouched. Side-effect
//! hooks can be registered per transition under the key
//! `"<from>:<trigger>:<to>"` and run after a successful lookup.

use crate::types::{ShuttleStatus, Trigger};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// Context handed to transition hooks.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub shuttle_id: String,
    pub from: ShuttleStatus,
    pub trigger: Trigger,
    pub to: ShuttleStatus,
}

/// A registered transition side effect.
pub type TransitionHook = Arc<dyn Fn(TransitionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Legal transitions. Everything not listed is rejected.
pub fn transition(from: ShuttleStatus, trigger: Trigger) -> Option<ShuttleStatus> {
    use ShuttleStatus as S;
    use Trigger as T;

    match (from, trigger) {
        (S::Free, T::PalletIn | T::StackIn) => Some(S::Loading),
        (S::Free, T::PalletOut | T::StackOut) => Some(S::Unloading),
        (S::Free, T::Fifo | T::Filo | T::Home) => Some(S::Moving),
        (S::Free, T::BatteryLow) => Some(S::LowBattery),
        (S::Free, T::Error) => Some(S::Error),
        (S::Busy | S::Loading | S::Unloading, T::Done) => Some(S::Free),
        (S::Busy | S::Loading | S::Unloading, T::Home) => Some(S::Moving),
        (S::Busy | S::Loading | S::Unloading, T::Error) => Some(S::Error),
        (S::Moving, T::Done) => Some(S::Free),
        (S::Moving, T::Error) => Some(S::Error),
        (S::Error, T::Reset) => Some(S::Free),
        (S::LowBattery, T::Charging) => Some(S::Charging),
        (S::Charging, T::Charged) => Some(S::Free),
        (S::Charging | S::LowBattery, T::Error) => Some(S::Error),
        _ => None,
    }
}

/// Hook key for a transition, `"<from>:<trigger>:<to>"`.
pub fn hook_key(from: ShuttleStatus, trigger: Trigger, to: ShuttleStatus) -> String {
    format!("{from}:{trigger}:{to}")
}

/// State machine with per-transition side-effect hooks.
pub struct StateMachine {
    hooks: RwLock<HashMap<String, TransitionHook>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a hook for one transition key (see [`hook_key`]).
    pub fn register_hook(&self, key: impl Into<String>, hook: TransitionHook) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.insert(key.into(), hook);
        }
    }

    /// Attempt a transition. Returns the new status when legal, `None`
    /// (current status preserved) otherwise. A registered hook runs after
    /// a successful lookup; hook failures are the hook's own problem.
    pub async fn try_transition(
        &self,
        shuttle_id: &str,
        from: ShuttleStatus,
        trigger: Trigger,
    ) -> Option<ShuttleStatus> {
        let Some(to) = transition(from, trigger) else {
            warn!(shuttle_id, %from, %trigger, "Rejected illegal state transition");
            return None;
        };

        info!(shuttle_id, %from, %trigger, %to, "Shuttle state transition");

        let hook = {
            match self.hooks.read() {
                Ok(hooks) => hooks.get(&hook_key(from, trigger, to)).cloned(),
                Err(e) => {
                    error!(error = %e, "Transition hook registry poisoned");
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook(TransitionEvent {
                shuttle_id: shuttle_id.to_string(),
                from,
                trigger,
                to,
            })
            .await;
        }

        Some(to)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_free_transitions() {
        use ShuttleStatus as S;
        use Trigger as T;
        assert_eq!(transition(S::Free, T::PalletIn), Some(S::Loading));
        assert_eq!(transition(S::Free, T::StackIn), Some(S::Loading));
        assert_eq!(transition(S::Free, T::PalletOut), Some(S::Unloading));
        assert_eq!(transition(S::Free, T::StackOut), Some(S::Unloading));
        assert_eq!(transition(S::Free, T::Fifo), Some(S::Moving));
        assert_eq!(transition(S::Free, T::Filo), Some(S::Moving));
        assert_eq!(transition(S::Free, T::Home), Some(S::Moving));
        assert_eq!(transition(S::Free, T::BatteryLow), Some(S::LowBattery));
        assert_eq!(transition(S::Free, T::Error), Some(S::Error));
    }

    #[test]
    fn test_working_transitions() {
        use ShuttleStatus as S;
        use Trigger as T;
        for from in [S::Busy, S::Loading, S::Unloading] {
            assert_eq!(transition(from, T::Done), Some(S::Free));
            assert_eq!(transition(from, T::Home), Some(S::Moving));
            assert_eq!(transition(from, T::Error), Some(S::Error));
        }
        assert_eq!(transition(S::Moving, T::Done), Some(S::Free));
        assert_eq!(transition(S::Moving, T::Error), Some(S::Error));
    }

    #[test]
    fn test_battery_and_recovery_transitions() {
        use ShuttleStatus as S;
        use Trigger as T;
        assert_eq!(transition(S::Error, T::Reset), Some(S::Free));
        assert_eq!(transition(S::LowBattery, T::Charging), Some(S::Charging));
        assert_eq!(transition(S::Charging, T::Charged), Some(S::Free));
        assert_eq!(transition(S::Charging, T::Error), Some(S::Error));
        assert_eq!(transition(S::LowBattery, T::Error), Some(S::Error));
    }

    #[test]
    fn test_unlisted_pairs_rejected() {
        use ShuttleStatus as S;
        use Trigger as T;
        assert_eq!(transition(S::Moving, T::Home), None);
        assert_eq!(transition(S::Free, T::Done), None);
        assert_eq!(transition(S::Error, T::Done), None);
        assert_eq!(transition(S::Charging, T::Done), None);
        assert_eq!(transition(S::Unknown, T::PalletIn), None);
        assert_eq!(transition(S::AwaitingMrcd, T::Done), None);
    }

    #[test]
    fn test_home_always_reaches_free_via_moving() {
        use ShuttleStatus as S;
        use Trigger as T;
        // HOME drives any working status through MOVING, then DONE lands FREE
        for from in [S::Busy, S::Loading, S::Unloading] {
            let moving = transition(from, T::Home).unwrap();
            assert_eq!(moving, S::Moving);
            assert_eq!(transition(moving, T::Done), Some(S::Free));
        }
    }

    #[tokio::test]
    async fn test_try_transition_runs_hook() {
        let machine = StateMachine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        machine.register_hook(
            hook_key(ShuttleStatus::Free, Trigger::PalletIn, ShuttleStatus::Loading),
            Arc::new(move |event| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    assert_eq!(event.shuttle_id, "s1");
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let next = machine
            .try_transition("s1", ShuttleStatus::Free, Trigger::PalletIn)
            .await;
        assert_eq!(next, Some(ShuttleStatus::Loading));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Illegal transition: no hook, no state change
        let next = machine
            .try_transition("s1", ShuttleStatus::Moving, Trigger::Home)
            .await;
        assert_eq!(next, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
