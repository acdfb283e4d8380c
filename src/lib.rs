mod broker;
mod bus;
mod config;
mod consumer;
mod dead_letter;
mod dispatch;
mod event;
mod groups;
mod listener;
mod registration;
mod retry;
mod serializer;
mod store;

pub use broker::{
    Acknowledge, BrokerError, BrokerTransport, Delivery, DeliverySource, InMemoryBroker,
    WireMessage,
};
pub use bus::{EventBus, PublishError, RegistrationError};
pub use config::BusConfig;
pub use consumer::DeliveryThrottle;
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, InMemoryDeadLetters};
pub use dispatch::{DispatchError, DispatchOutcome, ListenerFailure};
pub use event::{Event, EventId, Group, RegistrationKey};
pub use groups::{
    apply_groups_changed, AggregateReplayError, ConvergenceError, GroupRegistry, GroupUnbinder,
    GroupsChanged, RegisteredGroupsAggregate, REGISTERED_GROUPS_AGGREGATE_ID,
};
pub use listener::{EventListener, ExecutionMode, ListenerError};
pub use registration::Registration;
pub use retry::RetryBackoff;
pub use serializer::{BitcodeSerializer, CodecError, EventSerializer, JsonSerializer};
pub use store::{EventStore, InMemoryEventStore, StoreError, StoredEvent};
