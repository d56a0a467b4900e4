//! Core data model: commands, operational statuses, transition triggers,
//! shuttle state records and in-flight command envelopes.

use serde::{Deserialize, Serialize};

// ============================================================================
// Shuttle commands (gateway → shuttle)
// ============================================================================

/// Command vocabulary understood by the shuttle firmware.
///
/// The wire form is the SCREAMING_SNAKE token followed by `\n`; `FIFO`/`FILO`
/// additionally carry a zero-padded three-digit count (`FIFO-007`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShuttleCommand {
    PalletIn,
    PalletOut,
    Fifo,
    Filo,
    StackIn,
    StackOut,
    Home,
    Count,
    Status,
    Battery,
    Wdh,
    Wlh,
    Mrcd,
}

impl ShuttleCommand {
    /// Protocol token as sent on the wire (without parameters or newline).
    pub fn wire_token(&self) -> &'static str {
        match self {
            ShuttleCommand::PalletIn => "PALLET_IN",
            ShuttleCommand::PalletOut => "PALLET_OUT",
            ShuttleCommand::Fifo => "FIFO",
            ShuttleCommand::Filo => "FILO",
            ShuttleCommand::StackIn => "STACK_IN",
            ShuttleCommand::StackOut => "STACK_OUT",
            ShuttleCommand::Home => "HOME",
            ShuttleCommand::Count => "COUNT",
            ShuttleCommand::Status => "STATUS",
            ShuttleCommand::Battery => "BATTERY",
            ShuttleCommand::Wdh => "WDH",
            ShuttleCommand::Wlh => "WLH",
            ShuttleCommand::Mrcd => "MRCD",
        }
    }

    /// Parse a WMS-supplied command token.
    pub fn from_wire_token(token: &str) -> Option<Self> {
        match token.trim().to_uppercase().as_str() {
            "PALLET_IN" => Some(ShuttleCommand::PalletIn),
            "PALLET_OUT" => Some(ShuttleCommand::PalletOut),
            "FIFO" => Some(ShuttleCommand::Fifo),
            "FILO" => Some(ShuttleCommand::Filo),
            "STACK_IN" => Some(ShuttleCommand::StackIn),
            "STACK_OUT" => Some(ShuttleCommand::StackOut),
            "HOME" => Some(ShuttleCommand::Home),
            "COUNT" => Some(ShuttleCommand::Count),
            "STATUS" => Some(ShuttleCommand::Status),
            "BATTERY" => Some(ShuttleCommand::Battery),
            "WDH" => Some(ShuttleCommand::Wdh),
            "WLH" => Some(ShuttleCommand::Wlh),
            "MRCD" => Some(ShuttleCommand::Mrcd),
            _ => None,
        }
    }

    /// Commands that are executed immediately under the per-shuttle mutex,
    /// regardless of queue contents or current status. `HOME` is the
    /// emergency stop and `STATUS` must be answerable while busy.
    pub fn is_bypass(&self) -> bool {
        matches!(
            self,
            ShuttleCommand::Home
                | ShuttleCommand::Status
                | ShuttleCommand::Mrcd
                | ShuttleCommand::Battery
                | ShuttleCommand::Wdh
                | ShuttleCommand::Wlh
        )
    }

    /// `FIFO`/`FILO` carry a mandatory numeric pallet count.
    pub fn requires_numeric_params(&self) -> bool {
        matches!(self, ShuttleCommand::Fifo | ShuttleCommand::Filo)
    }

    /// Build the full wire frame for this command, including the trailing
    /// newline. Returns the reason string on invalid parameters.
    pub fn wire_frame(&self, params: Option<&str>) -> Result<String, String> {
        if self.requires_numeric_params() {
            let raw = params.unwrap_or("").trim();
            if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("expected a numeric count, got {raw:?}"));
            }
            let count: u32 = raw
                .parse()
                .map_err(|_| format!("count out of range: {raw:?}"))?;
            return Ok(format!("{}-{:03}\n", self.wire_token(), count));
        }
        Ok(format!("{}\n", self.wire_token()))
    }
}

impl std::fmt::Display for ShuttleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_token())
    }
}

// ============================================================================
// Operational status
// ============================================================================

/// Operational status of a shuttle as tracked by the gateway.
///
/// `AwaitingMrcd` is diagnostic-only: it appears in status reports from some
/// firmware revisions but takes part in no transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShuttleStatus {
    #[default]
    Unknown,
    Free,
    Busy,
    Moving,
    Loading,
    Unloading,
    Charging,
    LowBattery,
    NotReady,
    AwaitingMrcd,
    Error,
}

impl ShuttleStatus {
    /// Statuses during which a command owns the shuttle.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            ShuttleStatus::Busy
                | ShuttleStatus::Loading
                | ShuttleStatus::Unloading
                | ShuttleStatus::Moving
        )
    }
}

impl std::fmt::Display for ShuttleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            ShuttleStatus::Unknown => "UNKNOWN",
            ShuttleStatus::Free => "FREE",
            ShuttleStatus::Busy => "BUSY",
            ShuttleStatus::Moving => "MOVING",
            ShuttleStatus::Loading => "LOADING",
            ShuttleStatus::Unloading => "UNLOADING",
            ShuttleStatus::Charging => "CHARGING",
            ShuttleStatus::LowBattery => "LOW_BATTERY",
            ShuttleStatus::NotReady => "NOT_READY",
            ShuttleStatus::AwaitingMrcd => "AWAITING_MRCD",
            ShuttleStatus::Error => "ERROR",
        };
        write!(f, "{token}")
    }
}

// ============================================================================
// Transition triggers
// ============================================================================

/// Trigger for the operational state machine: either a command kind observed
/// in a `*_STARTED` report, or a synthetic event derived from shuttle output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    PalletIn,
    PalletOut,
    Fifo,
    Filo,
    StackIn,
    StackOut,
    Home,
    Done,
    Error,
    BatteryLow,
    Charging,
    Charged,
    Reset,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Trigger::PalletIn => "PALLET_IN",
            Trigger::PalletOut => "PALLET_OUT",
            Trigger::Fifo => "FIFO",
            Trigger::Filo => "FILO",
            Trigger::StackIn => "STACK_IN",
            Trigger::StackOut => "STACK_OUT",
            Trigger::Home => "HOME",
            Trigger::Done => "DONE",
            Trigger::Error => "ERROR",
            Trigger::BatteryLow => "BATTERY_LOW",
            Trigger::Charging => "CHARGING",
            Trigger::Charged => "CHARGED",
            Trigger::Reset => "RESET",
        };
        write!(f, "{token}")
    }
}

// ============================================================================
// Shuttle state record
// ============================================================================

/// Per-shuttle state record, durably stored in the state store.
///
/// Mutated only through [`StateStore::update`](crate::store::StateStore),
/// which refreshes `last_seen` on every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShuttleState {
    pub shuttle_id: String,
    #[serde(default)]
    pub status: ShuttleStatus,
    /// Operation currently believed to be in progress, wire form.
    #[serde(default)]
    pub current_command: Option<String>,
    /// Last shuttle line forwarded towards the WMS.
    #[serde(default)]
    pub last_message_sent_to_wms: Option<String>,
    /// Last WMS command delivered to the shuttle.
    #[serde(default)]
    pub last_message_received_from_wms: Option<String>,
    /// Raw battery report (may carry `<` or `%`).
    #[serde(default)]
    pub battery_level: Option<String>,
    #[serde(default)]
    pub location_data: Option<String>,
    #[serde(default)]
    pub pallet_count_data: Option<String>,
    #[serde(default)]
    pub wdh_hours: Option<i64>,
    #[serde(default)]
    pub wlh_hours: Option<i64>,
    /// Last error token (`F_CODE=17`, `TCP_TIMEOUT_SEND`, ...).
    #[serde(default)]
    pub error_code: Option<String>,
    /// Unix seconds of the most recent inbound/outbound activity.
    #[serde(default)]
    pub last_seen: u64,
    /// WMS correlation id of the command currently owning this shuttle.
    #[serde(default)]
    pub external_id: Option<String>,
    /// WMS document kind the owning command originated from.
    #[serde(default)]
    pub document_type: Option<String>,
}

impl ShuttleState {
    /// Fresh record for a newly configured shuttle.
    pub fn new(shuttle_id: impl Into<String>) -> Self {
        Self {
            shuttle_id: shuttle_id.into(),
            status: ShuttleStatus::Unknown,
            current_command: None,
            last_message_sent_to_wms: None,
            last_message_received_from_wms: None,
            battery_level: None,
            location_data: None,
            pallet_count_data: None,
            wdh_hours: None,
            wlh_hours: None,
            error_code: None,
            last_seen: now_unix_secs(),
            external_id: None,
            document_type: None,
        }
    }
}

// ============================================================================
// Command envelope & lifecycle
// ============================================================================

/// Lifecycle of a submitted command, tracked in the command registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Processing => "processing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        };
        write!(f, "{token}")
    }
}

/// A command in flight through the dispatch core.
///
/// Owned by the dispatcher while queued or processing; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    /// Gateway-minted unique id, used for cancellation and WMS correlation.
    pub id: String,
    pub shuttle_id: String,
    pub command: ShuttleCommand,
    pub params: Option<String>,
    /// WMS-side correlation id.
    pub external_id: Option<String>,
    /// Effective priority (lower = sooner).
    pub priority: i32,
    /// WMS document kind, echoed back in completion reports.
    pub document_type: Option<String>,
    /// Unix milliseconds at enqueue time.
    pub enqueued_at: u64,
}

// ============================================================================
// Time helpers
// ============================================================================

/// Current Unix timestamp in seconds.
pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
pub fn now_unix_millis() -> u64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = ShuttleState::new("shuttle_1");
        state.status = ShuttleStatus::Loading;
        state.current_command = Some("PALLET_IN".to_string());
        state.battery_level = Some("<85%".to_string());
        state.wdh_hours = Some(1200);

        let json = serde_json::to_string(&state).unwrap();
        let back: ShuttleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_status_wire_tokens() {
        let json = serde_json::to_string(&ShuttleStatus::LowBattery).unwrap();
        assert_eq!(json, "\"LOW_BATTERY\"");
        let json = serde_json::to_string(&ShuttleStatus::AwaitingMrcd).unwrap();
        assert_eq!(json, "\"AWAITING_MRCD\"");
        assert_eq!(ShuttleStatus::NotReady.to_string(), "NOT_READY");
    }

    #[test]
    fn test_command_tokens_round_trip() {
        for cmd in [
            ShuttleCommand::PalletIn,
            ShuttleCommand::PalletOut,
            ShuttleCommand::Fifo,
            ShuttleCommand::Filo,
            ShuttleCommand::StackIn,
            ShuttleCommand::StackOut,
            ShuttleCommand::Home,
            ShuttleCommand::Count,
            ShuttleCommand::Status,
            ShuttleCommand::Battery,
            ShuttleCommand::Wdh,
            ShuttleCommand::Wlh,
            ShuttleCommand::Mrcd,
        ] {
            assert_eq!(ShuttleCommand::from_wire_token(cmd.wire_token()), Some(cmd));
        }
        assert_eq!(ShuttleCommand::from_wire_token("NO_SUCH"), None);
    }

    #[test]
    fn test_bypass_set() {
        assert!(ShuttleCommand::Home.is_bypass());
        assert!(ShuttleCommand::Status.is_bypass());
        assert!(ShuttleCommand::Mrcd.is_bypass());
        assert!(ShuttleCommand::Battery.is_bypass());
        assert!(ShuttleCommand::Wdh.is_bypass());
        assert!(ShuttleCommand::Wlh.is_bypass());
        assert!(!ShuttleCommand::PalletIn.is_bypass());
        assert!(!ShuttleCommand::Count.is_bypass());
    }

    #[test]
    fn test_wire_frame_plain() {
        assert_eq!(
            ShuttleCommand::PalletIn.wire_frame(None).unwrap(),
            "PALLET_IN\n"
        );
        // Parameters are ignored for commands that do not take any.
        assert_eq!(ShuttleCommand::Home.wire_frame(Some("7")).unwrap(), "HOME\n");
    }

    #[test]
    fn test_wire_frame_fifo_padding() {
        assert_eq!(
            ShuttleCommand::Fifo.wire_frame(Some("7")).unwrap(),
            "FIFO-007\n"
        );
        assert_eq!(
            ShuttleCommand::Filo.wire_frame(Some("42")).unwrap(),
            "FILO-042\n"
        );
        assert_eq!(
            ShuttleCommand::Fifo.wire_frame(Some("123")).unwrap(),
            "FIFO-123\n"
        );
    }

    #[test]
    fn test_wire_frame_rejects_bad_params() {
        assert!(ShuttleCommand::Fifo.wire_frame(None).is_err());
        assert!(ShuttleCommand::Fifo.wire_frame(Some("")).is_err());
        assert!(ShuttleCommand::Fifo.wire_frame(Some("abc")).is_err());
        assert!(ShuttleCommand::Filo.wire_frame(Some("-3")).is_err());
    }
}
