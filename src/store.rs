//! Event-sourcing collaborator seam used by the convergence control plane.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::serializer::CodecError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    LockPoisoned(&'static str),
    /// Optimistic-concurrency conflict: the aggregate moved on since it
    /// was loaded. Reload and recompute.
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::LockPoisoned(operation) => {
                write!(f, "event store lock poisoned during {}", operation)
            }
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "concurrent append detected for aggregate {} (expected version {}, got {})",
                id, expected, actual
            ),
        }
    }
}

impl std::error::Error for StoreError {}

/// One record in an aggregate's append-only history.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StoredEvent {
    pub name: String,
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub timestamp: SystemTime,
}

// Binary payloads survive textual stores (JSON rows, log files) as base64.
mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl StoredEvent {
    /// Record an event with a bitcode-serialized payload.
    pub fn encode<T: Serialize>(
        name: impl Into<String>,
        sequence: u64,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let bytes = bitcode::serialize(payload).map_err(|e| CodecError {
            message: e.to_string(),
        })?;
        Ok(StoredEvent {
            name: name.into(),
            payload: bytes,
            sequence,
            timestamp: SystemTime::now(),
        })
    }

    /// Deserialize the payload into the specified type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        bitcode::deserialize(&self.payload).map_err(|e| CodecError {
            message: e.to_string(),
        })
    }
}

/// Append-only event store with an append-with-expected-version contract.
///
/// The implementation behind it (log file, table, ...) is an external
/// collaborator; concurrent writers from different nodes are serialized by
/// this contract alone.
pub trait EventStore: Send + Sync {
    /// Append `records` to `aggregate_id`'s history, failing with
    /// `VersionConflict` unless the history currently holds exactly
    /// `expected_version` records.
    fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        records: Vec<StoredEvent>,
    ) -> Result<(), StoreError>;

    /// Load the ordered history of `aggregate_id`. Empty if the aggregate
    /// does not exist yet.
    fn load(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, StoreError>;
}

/// In-memory store for tests and single-process deployments.
pub struct InMemoryEventStore {
    storage: RwLock<HashMap<String, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        InMemoryEventStore {
            storage: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        records: Vec<StoredEvent>,
    ) -> Result<(), StoreError> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| StoreError::LockPoisoned("append"))?;
        let history = storage.entry(aggregate_id.to_string()).or_default();
        let actual = history.len() as u64;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                id: aggregate_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        history.extend(records);
        Ok(())
    }

    fn load(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| StoreError::LockPoisoned("load"))?;
        Ok(storage.get(aggregate_id).cloned().unwrap_or_default())
    }
}
