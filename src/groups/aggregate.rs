//! Cluster-wide record of which groups must exist.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::event::Group;
use crate::serializer::CodecError;
use crate::store::{EventStore, StoreError, StoredEvent};

/// The single, well-known identity of the aggregate.
pub const REGISTERED_GROUPS_AGGREGATE_ID: &str = "registered-groups";

pub(crate) const GROUPS_CHANGED: &str = "GroupsChanged";

/// The change event appended by a "require these groups" command: the
/// symmetric difference against the previously required set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsChanged {
    pub added: BTreeSet<Group>,
    pub removed: BTreeSet<Group>,
}

impl GroupsChanged {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Event-sourced aggregate whose state is the set of groups currently
/// required to exist cluster-wide.
///
/// Created lazily on the first command; rebuilt by replaying its history;
/// mutated only by appending change events after an optimistic reload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredGroupsAggregate {
    required: BTreeSet<Group>,
    version: u64,
}

impl RegisteredGroupsAggregate {
    /// Rebuild the aggregate by replaying its event history. An aggregate
    /// that was never written replays to the empty set at version 0.
    pub fn load(store: &dyn EventStore) -> Result<Self, AggregateReplayError> {
        let records = store.load(REGISTERED_GROUPS_AGGREGATE_ID)?;
        let mut required = BTreeSet::new();
        for record in &records {
            let change: GroupsChanged = record.decode()?;
            for group in &change.removed {
                required.remove(group);
            }
            required.extend(change.added.iter().cloned());
        }
        Ok(RegisteredGroupsAggregate {
            required,
            version: records.len() as u64,
        })
    }

    pub fn required(&self) -> &BTreeSet<Group> {
        &self.required
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Diff the currently required set against this aggregate's state.
    /// `None` when nothing changed (no event should be appended).
    pub fn require(&self, required_now: &BTreeSet<Group>) -> Option<GroupsChanged> {
        let added: BTreeSet<Group> = required_now.difference(&self.required).cloned().collect();
        let removed: BTreeSet<Group> = self.required.difference(required_now).cloned().collect();
        let change = GroupsChanged { added, removed };
        if change.is_empty() {
            None
        } else {
            Some(change)
        }
    }
}

/// Replay failure: either the store or a record that no longer decodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregateReplayError {
    Store(StoreError),
    Codec(CodecError),
}

impl std::fmt::Display for AggregateReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateReplayError::Store(e) => write!(f, "aggregate replay failed: {}", e),
            AggregateReplayError::Codec(e) => write!(f, "aggregate replay failed: {}", e),
        }
    }
}

impl std::error::Error for AggregateReplayError {}

impl From<StoreError> for AggregateReplayError {
    fn from(e: StoreError) -> Self {
        AggregateReplayError::Store(e)
    }
}

impl From<CodecError> for AggregateReplayError {
    fn from(e: CodecError) -> Self {
        AggregateReplayError::Codec(e)
    }
}
