//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::orchestrator::Orchestrator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<Orchestrator>,
    /// `None` when running on the in-memory store.
    db: Option<Database>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, db: Option<Database>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { orchestrator, db }),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
