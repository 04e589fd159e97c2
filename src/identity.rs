//! Identity store collaborator.

use crate::protocol::models::Subject;
use crate::GateError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Read access to subjects plus the subscription linkage write-back.
pub trait IdentityStore: Send + Sync {
    /// Resolve the subject named by a credential's `sub` claim.
    fn find_subject(&self, id: &str) -> Option<Subject>;

    /// Record that the subject has had an activated subscription.
    fn mark_subscribed(&self, id: &str) -> Result<(), GateError>;
}

/// In-process identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    subjects: RwLock<HashMap<String, Subject>>,
}

impl MemoryIdentityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subject.
    pub fn insert(&self, subject: Subject) {
        if let Ok(mut subjects) = self.subjects.write() {
            subjects.insert(subject.id.clone(), subject);
        }
    }

    /// Disable a subject; its credentials stop admitting requests.
    pub fn disable(&self, id: &str) -> Result<(), GateError> {
        let mut subjects = self
            .subjects
            .write()
            .map_err(|_| GateError::TransientStorage("identity store lock poisoned".to_string()))?;
        let subject = subjects
            .get_mut(id)
            .ok_or_else(|| GateError::NotFound(format!("subject {}", id)))?;
        subject.enabled = false;
        Ok(())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn find_subject(&self, id: &str) -> Option<Subject> {
        self.subjects.read().ok()?.get(id).cloned()
    }

    fn mark_subscribed(&self, id: &str) -> Result<(), GateError> {
        let mut subjects = self
            .subjects
            .write()
            .map_err(|_| GateError::TransientStorage("identity store lock poisoned".to_string()))?;
        let subject = subjects
            .get_mut(id)
            .ok_or_else(|| GateError::NotFound(format!("subject {}", id)))?;
        subject.has_subscription = true;
        Ok(())
    }
}
