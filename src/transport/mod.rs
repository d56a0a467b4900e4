//! Shuttle transport
//!
//! Two independent halves of the shuttle-facing TCP plumbing:
//! - [`outbound`]: short-lived connection per command to the shuttle's
//!   command port
//! - [`listener`]: long-lived acceptor for shuttle-initiated connections,
//!   feeding lines to the message interpreter
//!
//! The halves share no state except the state store and the metrics.

pub mod listener;
pub mod outbound;

pub use listener::ShuttleListener;
pub use outbound::{send_line, SendError};
