//! The event bus facade consumed by the mail server.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::broker::{BrokerError, BrokerTransport, WireMessage};
use crate::config::BusConfig;
use crate::consumer::{GroupConsumer, GroupTable};
use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetters};
use crate::dispatch::{DispatchOutcome, KeyRegistry, LocalDispatcher, TaskGroup};
use crate::event::{Event, Group, RegistrationKey};
use crate::groups::{apply_groups_changed, ConvergenceError, GroupRegistry, GroupsChanged};
use crate::listener::EventListener;
use crate::registration::Registration;
use crate::serializer::{BitcodeSerializer, EventSerializer};
use crate::store::{EventStore, InMemoryEventStore};

/// Error registering a group listener.
#[derive(Debug)]
pub enum RegistrationError {
    /// This process already has a listener bound to the group.
    GroupAlreadyRegistered(Group),
    /// The group's queue could not be established, startup retries
    /// included. Fatal for this registration.
    Broker(BrokerError),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::GroupAlreadyRegistered(group) => {
                write!(f, "group {} already has a listener in this process", group)
            }
            RegistrationError::Broker(e) => write!(f, "failed to establish group queue: {}", e),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Error publishing a dispatched event to the broadcast channel.
#[derive(Debug)]
pub enum PublishError {
    Codec(crate::serializer::CodecError),
    Broker(BrokerError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Codec(e) => write!(f, "failed to publish event: {}", e),
            PublishError::Broker(e) => write!(f, "failed to publish event: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

/// Propagates state-change notifications from the component that caused
/// them to every interested listener, in-process and across the cluster.
pub struct EventBus {
    broker: Arc<dyn BrokerTransport>,
    serializer: Arc<dyn EventSerializer>,
    dead_letters: Arc<dyn DeadLetterStore>,
    store: Arc<dyn EventStore>,
    config: BusConfig,
    keys: Arc<KeyRegistry>,
    groups: Arc<GroupTable>,
    tasks: Arc<TaskGroup>,
}

impl EventBus {
    /// Create a bus over the given broker with in-memory collaborators
    /// and default configuration. Swap the seams with the `with_*`
    /// builders.
    pub fn new(broker: Arc<dyn BrokerTransport>) -> Self {
        EventBus {
            broker,
            serializer: Arc::new(BitcodeSerializer),
            dead_letters: Arc::new(InMemoryDeadLetters::new()),
            store: Arc::new(InMemoryEventStore::new()),
            config: BusConfig::default(),
            keys: Arc::new(KeyRegistry::new()),
            groups: Arc::new(GroupTable::new()),
            tasks: TaskGroup::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn EventSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> Arc<dyn DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }

    /// Bind `listener` to a cluster-shared group: declare the durable
    /// queue if absent and start a consumer loop competing with every
    /// other process serving the group.
    pub async fn register(
        &self,
        listener: Arc<dyn EventListener>,
        group: Group,
    ) -> Result<Registration, RegistrationError> {
        let Some((token, shutdown)) = self.groups.try_claim(&group) else {
            return Err(RegistrationError::GroupAlreadyRegistered(group));
        };

        if let Err(broker_error) = self.establish_queue(&group).await {
            self.groups.release(&group, token);
            return Err(RegistrationError::Broker(broker_error));
        }
        let source = match self.broker.consume(&group).await {
            Ok(source) => source,
            Err(broker_error) => {
                self.groups.release(&group, token);
                return Err(RegistrationError::Broker(broker_error));
            }
        };

        let consumer = GroupConsumer::new(
            group.clone(),
            listener,
            Arc::clone(&self.broker),
            Arc::clone(&self.serializer),
            Arc::clone(&self.dead_letters),
            self.config.retry,
            self.config.execution_rate,
        );
        tokio::spawn(consumer.run(source, shutdown));
        debug!(group = %group, "registered group listener");
        Ok(Registration::for_group(Arc::clone(&self.groups), group, token))
    }

    /// Add `listener` to the in-memory key fan-out. Never fails.
    pub fn register_key(
        &self,
        listener: Arc<dyn EventListener>,
        key: RegistrationKey,
    ) -> Registration {
        let token = self.keys.insert(key.clone(), listener);
        debug!(key = %key, "registered key listener");
        Registration::for_key(Arc::clone(&self.keys), key, token)
    }

    /// Publish `event` once to the broadcast channel (reaching every
    /// group anywhere) and deliver it to every local listener whose key
    /// intersects `keys`. Returns once all synchronous listeners have
    /// completed; their failures are aggregated in the outcome.
    pub async fn dispatch(
        &self,
        event: Event,
        keys: BTreeSet<RegistrationKey>,
    ) -> Result<DispatchOutcome, PublishError> {
        let payload = self.serializer.to_bytes(&event).map_err(PublishError::Codec)?;
        self.broker
            .publish(WireMessage::new(payload))
            .await
            .map_err(PublishError::Broker)?;

        let event = Arc::new(event);
        let dispatcher = LocalDispatcher::new(
            Arc::clone(&self.keys),
            Arc::clone(&self.tasks),
            self.config.retry,
        );
        Ok(dispatcher.dispatch(&event, &keys).await)
    }

    /// Run the "require these groups" command and react to its change
    /// event: queues of groups removed cluster-wide and not bound in this
    /// process are unbound, so stale bindings do not accumulate across
    /// deploys.
    pub async fn require_groups(
        &self,
        required: &BTreeSet<Group>,
    ) -> Result<Option<GroupsChanged>, ConvergenceError> {
        let registry = GroupRegistry::new(Arc::clone(&self.store));
        let change = registry.require_groups(required)?;
        if let Some(change) = &change {
            apply_groups_changed(change, &self.groups.bound(), self.broker.as_ref()).await;
        }
        Ok(change)
    }

    /// Stop every group consumer and drain in-flight local dispatches.
    /// Durable queues stay intact for the rest of the cluster.
    pub async fn shutdown(&self) {
        self.groups.release_all();
        self.tasks.wait_idle().await;
        debug!("event bus shut down");
    }

    // Transient declaration failures are retried with backoff and jitter;
    // exhausting the budget is fatal for the registration.
    async fn establish_queue(&self, group: &Group) -> Result<(), BrokerError> {
        let policy = self.config.startup;
        let mut attempt: u32 = 0;
        loop {
            match self.broker.declare_group_queue(group).await {
                Ok(()) => return Ok(()),
                Err(broker_error) => {
                    if attempt >= policy.max_retries() {
                        return Err(broker_error);
                    }
                    attempt += 1;
                    let delay = policy.delay_before(attempt);
                    warn!(
                        group = %group,
                        attempt,
                        ?delay,
                        %broker_error,
                        "queue declaration failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliverySource, InMemoryBroker};
    use crate::listener::ListenerError;
    use crate::retry::RetryBackoff;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl EventListener for Noop {
        async fn handle(&self, _event: &Event) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_group_registration_in_process_fails() {
        let bus = EventBus::new(Arc::new(InMemoryBroker::new()));
        let group = Group::new("search-indexer");

        let registration = bus.register(Arc::new(Noop), group.clone()).await.unwrap();
        let err = bus.register(Arc::new(Noop), group.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::GroupAlreadyRegistered(ref g) if *g == group
        ));

        // Unregistering frees the group for this process again.
        registration.unregister();
        bus.register(Arc::new(Noop), group).await.unwrap();
    }

    /// Broker whose queue declaration fails a fixed number of times.
    struct FlakyBroker {
        inner: InMemoryBroker,
        declare_failures: AtomicU32,
    }

    #[async_trait]
    impl BrokerTransport for FlakyBroker {
        async fn declare_group_queue(&self, group: &Group) -> Result<(), BrokerError> {
            if self
                .declare_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(BrokerError::ConnectionFailed("broker restarting".into()));
            }
            self.inner.declare_group_queue(group).await
        }

        async fn publish(&self, message: WireMessage) -> Result<(), BrokerError> {
            self.inner.publish(message).await
        }

        async fn publish_to_group(
            &self,
            group: &Group,
            message: WireMessage,
        ) -> Result<(), BrokerError> {
            self.inner.publish_to_group(group, message).await
        }

        async fn consume(&self, group: &Group) -> Result<Box<dyn DeliverySource>, BrokerError> {
            self.inner.consume(group).await
        }

        async fn delete_group_queue(&self, group: &Group) -> Result<(), BrokerError> {
            self.inner.delete_group_queue(group).await
        }
    }

    fn fast_startup() -> BusConfig {
        BusConfig::default().with_startup(RetryBackoff::new(2, Duration::from_millis(1), 0.0))
    }

    #[tokio::test]
    async fn transient_declaration_failure_is_retried() {
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryBroker::new(),
            declare_failures: AtomicU32::new(2),
        });
        let bus = EventBus::new(broker).with_config(fast_startup());

        bus.register(Arc::new(Noop), Group::new("search-indexer"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_declaration_retries_fail_the_registration() {
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryBroker::new(),
            declare_failures: AtomicU32::new(u32::MAX),
        });
        let bus = EventBus::new(broker).with_config(fast_startup());

        let err = bus
            .register(Arc::new(Noop), Group::new("search-indexer"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Broker(_)));
        // The failed claim is released.
        assert!(!bus.groups.contains(&Group::new("search-indexer")));
    }

    #[tokio::test]
    async fn delivery_never_crashes_the_delivering_operation() {
        struct Failing;

        #[async_trait]
        impl EventListener for Failing {
            async fn handle(&self, _event: &Event) -> Result<(), ListenerError> {
                Err("listener broke".into())
            }
        }

        let bus = EventBus::new(Arc::new(InMemoryBroker::new()));
        let key = RegistrationKey::new("mailbox-1");
        bus.register_key(Arc::new(Failing), key.clone());

        let outcome = bus
            .dispatch(
                Event::new("alice", "MessageAppended", vec![]),
                [key].into_iter().collect(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 1);
    }
}

