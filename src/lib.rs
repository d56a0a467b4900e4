//! Shuttle Gateway: WMS ↔ pallet-shuttle coordination
//!
//! Long-running network service mediating between a Warehouse Management
//! System and a fleet of autonomous pallet shuttles speaking a line-oriented
//! TCP protocol.
//!
//! ## Architecture
//!
//! - **State Store**: durable per-shuttle records with compare-and-set updates
//! - **State Machine**: legal operational transitions with side-effect hooks
//! - **Transport**: outbound command frames + inbound shuttle listener
//! - **Interpreter**: shuttle protocol lines → state updates and triggers
//! - **Dispatch Core**: per-shuttle priority queues, mutexes, workers, retry
//! - **Heartbeat Monitor**: liveness sweeps with STATUS probes
//! - **Webhook Reporter**: fire-and-forget event posts to the WMS
//! - **WMS Poller**: order intake and completion push-back
//! - **Admin API**: Axum surface for submission, inspection and remapping

pub mod api;
pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod interpreter;
pub mod metrics;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod types;
pub mod webhook;
pub mod wms;

// Re-export the submission surface
pub use dispatch::{
    CommandRegistry, Dispatcher, RetryPolicy, SubmitError, SubmitOutcome, SubmitRequest,
};

// Re-export the core data model
pub use types::{
    CommandEnvelope, CommandStatus, ShuttleCommand, ShuttleState, ShuttleStatus, Trigger,
};

// Re-export component entry points
pub use config::Settings;
pub use heartbeat::HeartbeatMonitor;
pub use interpreter::MessageInterpreter;
pub use metrics::GatewayMetrics;
pub use state_machine::StateMachine;
pub use store::{MemoryStateStore, SledStateStore, StateStore, StoreError};
pub use transport::ShuttleListener;
pub use webhook::WebhookReporter;
