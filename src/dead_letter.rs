//! Quarantine for events that exhausted their retry budget.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::event::{Event, EventId, Group};
use crate::store::StoreError;

/// A quarantined event, keyed by `(Group, EventId)`. Retained for manual
/// inspection and replay; never auto-expires.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetterEntry {
    pub group: Group,
    pub event: Event,
    pub reason: String,
    pub stored_at: SystemTime,
}

impl DeadLetterEntry {
    pub fn new(group: Group, event: Event, reason: impl Into<String>) -> Self {
        DeadLetterEntry {
            group,
            event,
            reason: reason.into(),
            stored_at: SystemTime::now(),
        }
    }
}

/// Storage for dead letters, consumed by an operator-facing recovery tool.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    async fn list(&self, group: &Group) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Remove one entry. Returns it if it was present.
    async fn remove(
        &self,
        group: &Group,
        event_id: EventId,
    ) -> Result<Option<DeadLetterEntry>, StoreError>;

    async fn contains(&self, group: &Group, event_id: EventId) -> Result<bool, StoreError> {
        Ok(self
            .list(group)
            .await?
            .iter()
            .any(|entry| entry.event.id() == event_id))
    }
}

/// In-memory dead-letter store for tests and single-process deployments.
pub struct InMemoryDeadLetters {
    entries: RwLock<BTreeMap<(Group, EventId), DeadLetterEntry>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        InMemoryDeadLetters {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryDeadLetters {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetters {
    async fn store(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("dead letter store"))?;
        entries.insert((entry.group.clone(), entry.event.id()), entry);
        Ok(())
    }

    async fn list(&self, group: &Group) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("dead letter list"))?;
        Ok(entries
            .values()
            .filter(|entry| &entry.group == group)
            .cloned()
            .collect())
    }

    async fn remove(
        &self,
        group: &Group,
        event_id: EventId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned("dead letter remove"))?;
        Ok(entries.remove(&(group.clone(), event_id)))
    }

    async fn contains(&self, group: &Group, event_id: EventId) -> Result<bool, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::LockPoisoned("dead letter contains"))?;
        Ok(entries.contains_key(&(group.clone(), event_id)))
    }
}
