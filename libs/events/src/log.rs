//! In-memory, append-only audit log for one deployment.

use chrono::{DateTime, Utc};
use labfleet_id::{AuditSeq, DeploymentId};

use crate::{AuditDraft, AuditEvent, EventError};

/// Ordered log of one deployment's audit events.
///
/// The log hands out sequence numbers itself, so two events appended in
/// causal order keep that order even if the clock steps backwards between
/// them.
#[derive(Debug, Clone)]
pub struct AuditLog {
    deployment_id: DeploymentId,
    events: Vec<AuditEvent>,
}

impl AuditLog {
    pub fn new(deployment_id: DeploymentId) -> Self {
        Self {
            deployment_id,
            events: Vec::new(),
        }
    }

    /// Sequence number the next appended event will receive.
    pub fn next_seq(&self) -> AuditSeq {
        self.events
            .last()
            .map(|e| e.seq.next())
            .unwrap_or(AuditSeq::FIRST)
    }

    /// Seals and appends a draft, returning the stored event.
    pub fn append(&mut self, draft: AuditDraft, occurred_at: DateTime<Utc>) -> &AuditEvent {
        let event = draft.seal(self.deployment_id, self.next_seq(), occurred_at);
        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    /// Appends an event sealed elsewhere (e.g. loaded from storage).
    pub fn push_sealed(&mut self, event: AuditEvent) -> Result<(), EventError> {
        let expected = self.next_seq();
        if event.seq != expected {
            return Err(EventError::InvalidSequence {
                expected: expected.value(),
                actual: event.seq.value(),
            });
        }
        self.events.push(event);
        Ok(())
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
