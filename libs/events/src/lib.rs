//! # labfleet-events
//!
//! The deployment audit log: what happened to a deployment, in order.
//!
//! ## Design Principles
//!
//! - Events are immutable once appended; nothing updates or deletes them
//! - Every event belongs to exactly one deployment
//! - Order is the per-deployment sequence number, never the wall clock
//! - Events never carry credential material (messages name targets and
//!   reasons, not secrets)
//!
//! Producers build an [`AuditDraft`] describing the event; the store seals it
//! into an [`AuditEvent`] by assigning the next sequence number inside the same
//! transaction as the state change it describes.

mod error;
mod log;
mod types;

pub use error::EventError;
pub use log::AuditLog;
pub use types::*;
