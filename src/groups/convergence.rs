//! The "require these groups" command and the unbind reaction to its
//! change events.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::aggregate::{
    AggregateReplayError, GroupsChanged, RegisteredGroupsAggregate, GROUPS_CHANGED,
    REGISTERED_GROUPS_AGGREGATE_ID,
};
use crate::broker::{BrokerError, BrokerTransport};
use crate::event::Group;
use crate::serializer::CodecError;
use crate::store::{EventStore, StoreError, StoredEvent};

const DEFAULT_APPEND_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub enum ConvergenceError {
    /// The aggregate could not be replayed.
    Replay(AggregateReplayError),
    /// The change event could not be encoded.
    Encode(CodecError),
    /// Appending failed for a reason other than a version conflict.
    Append(StoreError),
    /// Every append attempt lost the optimistic-concurrency race.
    Conflicted { attempts: u32 },
}

impl fmt::Display for ConvergenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceError::Replay(e) => write!(f, "convergence failed: {}", e),
            ConvergenceError::Encode(e) => write!(f, "convergence failed: {}", e),
            ConvergenceError::Append(e) => write!(f, "convergence failed: {}", e),
            ConvergenceError::Conflicted { attempts } => write!(
                f,
                "convergence failed: {} append attempts lost the version race",
                attempts
            ),
        }
    }
}

impl std::error::Error for ConvergenceError {}

impl From<AggregateReplayError> for ConvergenceError {
    fn from(e: AggregateReplayError) -> Self {
        ConvergenceError::Replay(e)
    }
}

/// Handles the sole control-plane command: record the set of groups this
/// deployment requires, serialized against concurrent nodes by the store's
/// append-with-expected-version contract.
pub struct GroupRegistry {
    store: Arc<dyn EventStore>,
    max_attempts: u32,
}

impl GroupRegistry {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        GroupRegistry {
            store,
            max_attempts: DEFAULT_APPEND_ATTEMPTS,
        }
    }

    /// Bound the number of reload-and-retry rounds on append conflicts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Diff `required` against the recorded set and append one change
    /// event when they differ. Returns the recorded change, or `None`
    /// when the sets already match.
    ///
    /// A conflicting append means another node converged concurrently:
    /// reload, recompute, retry — bounded by `max_attempts`.
    pub fn require_groups(
        &self,
        required: &BTreeSet<Group>,
    ) -> Result<Option<GroupsChanged>, ConvergenceError> {
        for attempt in 1..=self.max_attempts {
            let aggregate = RegisteredGroupsAggregate::load(self.store.as_ref())?;
            let Some(change) = aggregate.require(required) else {
                return Ok(None);
            };

            let record = StoredEvent::encode(GROUPS_CHANGED, aggregate.version() + 1, &change)
                .map_err(ConvergenceError::Encode)?;
            match self.store.append(
                REGISTERED_GROUPS_AGGREGATE_ID,
                aggregate.version(),
                vec![record],
            ) {
                Ok(()) => {
                    debug!(
                        added = change.added.len(),
                        removed = change.removed.len(),
                        "recorded group set change"
                    );
                    return Ok(Some(change));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    warn!(attempt, "group set append conflicted, reloading");
                }
                Err(other) => return Err(ConvergenceError::Append(other)),
            }
        }
        Err(ConvergenceError::Conflicted {
            attempts: self.max_attempts,
        })
    }
}

/// Issues unbind/delete instructions for group queues. The broker
/// transport is the canonical implementation.
#[async_trait]
pub trait GroupUnbinder: Send + Sync {
    async fn unbind(&self, group: &Group) -> Result<(), BrokerError>;
}

#[async_trait]
impl<T: BrokerTransport + ?Sized> GroupUnbinder for T {
    async fn unbind(&self, group: &Group) -> Result<(), BrokerError> {
        self.delete_group_queue(group).await
    }
}

/// React to a change event: unbind the queue of every removed group that
/// is not currently bound in this process, so stale bindings from removed
/// listeners do not accumulate across deploys.
///
/// Best-effort: a failed unbind is logged and does not stop the rest.
pub async fn apply_groups_changed<U: GroupUnbinder + ?Sized>(
    change: &GroupsChanged,
    locally_bound: &BTreeSet<Group>,
    unbinder: &U,
) {
    for group in &change.removed {
        if locally_bound.contains(group) {
            debug!(group = %group, "group no longer required but still bound here, keeping queue");
            continue;
        }
        match unbinder.unbind(group).await {
            Ok(()) => debug!(group = %group, "unbound queue of removed group"),
            Err(broker_error) => {
                error!(group = %group, %broker_error, "failed to unbind removed group")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn groups(names: &[&str]) -> BTreeSet<Group> {
        names.iter().map(|n| Group::new(*n)).collect()
    }

    #[test]
    fn first_command_creates_the_aggregate() {
        let store = Arc::new(InMemoryEventStore::new());
        let registry = GroupRegistry::new(store.clone());

        let change = registry.require_groups(&groups(&["a", "b"])).unwrap().unwrap();
        assert_eq!(change.added, groups(&["a", "b"]));
        assert!(change.removed.is_empty());

        let aggregate = RegisteredGroupsAggregate::load(store.as_ref()).unwrap();
        assert_eq!(aggregate.required(), &groups(&["a", "b"]));
        assert_eq!(aggregate.version(), 1);
    }

    #[test]
    fn unchanged_set_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let registry = GroupRegistry::new(store.clone());
        registry.require_groups(&groups(&["a"])).unwrap();

        assert!(registry.require_groups(&groups(&["a"])).unwrap().is_none());
        let aggregate = RegisteredGroupsAggregate::load(store.as_ref()).unwrap();
        assert_eq!(aggregate.version(), 1);
    }

    #[test]
    fn deploy_change_records_both_sides_of_the_diff() {
        let store = Arc::new(InMemoryEventStore::new());
        let registry = GroupRegistry::new(store.clone());
        registry.require_groups(&groups(&["a", "b"])).unwrap();

        let change = registry.require_groups(&groups(&["b", "c"])).unwrap().unwrap();
        assert_eq!(change.added, groups(&["c"]));
        assert_eq!(change.removed, groups(&["a"]));

        let aggregate = RegisteredGroupsAggregate::load(store.as_ref()).unwrap();
        assert_eq!(aggregate.required(), &groups(&["b", "c"]));
    }

    /// Store wrapper that loses the version race a fixed number of times.
    struct Contended {
        inner: InMemoryEventStore,
        conflicts_left: AtomicU32,
    }

    impl EventStore for Contended {
        fn append(
            &self,
            aggregate_id: &str,
            expected_version: u64,
            records: Vec<StoredEvent>,
        ) -> Result<(), StoreError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(StoreError::VersionConflict {
                    id: aggregate_id.to_string(),
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            self.inner.append(aggregate_id, expected_version, records)
        }

        fn load(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
            self.inner.load(aggregate_id)
        }
    }

    #[test]
    fn append_conflict_is_reloaded_and_retried() {
        let store = Arc::new(Contended {
            inner: InMemoryEventStore::new(),
            conflicts_left: AtomicU32::new(2),
        });
        let registry = GroupRegistry::new(store.clone());

        let change = registry.require_groups(&groups(&["a"])).unwrap().unwrap();
        assert_eq!(change.added, groups(&["a"]));
    }

    #[test]
    fn persistent_conflicts_exhaust_the_bound() {
        let store = Arc::new(Contended {
            inner: InMemoryEventStore::new(),
            conflicts_left: AtomicU32::new(u32::MAX),
        });
        let registry = GroupRegistry::new(store).with_max_attempts(3);

        let err = registry.require_groups(&groups(&["a"])).unwrap_err();
        assert!(matches!(err, ConvergenceError::Conflicted { attempts: 3 }));
    }

    struct RecordingUnbinder {
        unbound: Mutex<Vec<Group>>,
    }

    #[async_trait]
    impl GroupUnbinder for RecordingUnbinder {
        async fn unbind(&self, group: &Group) -> Result<(), BrokerError> {
            self.unbound.lock().unwrap().push(group.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn removed_groups_are_unbound_unless_locally_bound() {
        let unbinder = RecordingUnbinder {
            unbound: Mutex::new(Vec::new()),
        };
        let change = GroupsChanged {
            added: groups(&["c"]),
            removed: groups(&["a", "b"]),
        };

        // "b" is still served by a listener bound in this process.
        apply_groups_changed(&change, &groups(&["b", "c"]), &unbinder).await;

        let unbound = unbinder.unbound.lock().unwrap();
        assert_eq!(unbound.as_slice(), &[Group::new("a")]);
    }
}
