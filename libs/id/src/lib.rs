//! # labfleet-id
//!
//! Typed identifiers for every record the orchestrator reads or writes.
//!
//! All ids share the canonical form `{prefix}_{ulid}`:
//!
//! - `dep_01HV4Z2WQXKJNM8GPQY6VBKC3D` (deployment)
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` (instance)
//! - `grp_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (course group)
//!
//! The prefix keeps a group id from being passed where a member id is
//! expected, and the ULID keeps ids sortable by creation time. Parsing is
//! strict: the prefix must match exactly and the ULID must be valid.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
