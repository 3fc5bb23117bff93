//! labfleet orchestrator library.
//!
//! Fans a deployment request out into one lab instance per course, group or
//! member, hands each instance to an asynchronous provisioning queue, and
//! tracks the results. The `orchestrator` binary wires these pieces to
//! Postgres, Redis and an HTTP API; the library surface exists for
//! integration testing and reuse.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod resolver;
pub mod state;
pub mod store;
pub mod usage;
