use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn random() -> Self {
        EventId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        EventId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable fact about a state change in the mail store.
///
/// Carries a unique identifier, the acting user, a kind describing what
/// changed (e.g. "MessageAppended") and an opaque serialized payload. Never
/// mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    user: String,
    kind: String,
    payload: Vec<u8>,
}

impl Event {
    pub fn new(user: impl Into<String>, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Event {
            id: EventId::random(),
            user: user.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Rebuild an event with a known identifier (deserialization, tests).
    pub fn with_id(
        id: EventId,
        user: impl Into<String>,
        kind: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Event {
            id,
            user: user.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Build an event whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(
        user: impl Into<String>,
        kind: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Event::new(user, kind, serde_json::to_vec(body)?))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A stable, process-independent name identifying a class of listener
/// (e.g. "search-indexer").
///
/// At most one listener instance may be bound to a given group within one
/// process; across the cluster, exactly one instance consumes each delivery
/// addressed to the group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(String);

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Group(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic name of this group's durable queue on the broker.
    pub fn queue_name(&self) -> String {
        format!("mailbus-group-{}", self.0)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Group {
    fn from(name: &str) -> Self {
        Group::new(name)
    }
}

/// A dynamic, process-local fan-out key (e.g. one mailbox).
///
/// Many listeners may register under the same key; dispatching to a key
/// delivers to all of them, in the local process only.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationKey(String);

impl RegistrationKey {
    pub fn new(name: impl Into<String>) -> Self {
        RegistrationKey(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RegistrationKey {
    fn from(name: &str) -> Self {
        RegistrationKey::new(name)
    }
}
