//! Per-group consumer loops: competing consumption, retry scheduling and
//! dead-lettering.

mod throttle;

pub use throttle::DeliveryThrottle;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::broker::{BrokerTransport, Delivery, DeliverySource};
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::event::Group;
use crate::listener::EventListener;
use crate::retry::RetryBackoff;
use crate::serializer::EventSerializer;

pub(crate) struct GroupHandle {
    token: u64,
    shutdown: watch::Sender<bool>,
}

/// The groups bound in this process, one consumer each.
///
/// Guards the invariant that at most one listener instance is bound to a
/// given group per process.
pub(crate) struct GroupTable {
    inner: Mutex<GroupTableInner>,
}

struct GroupTableInner {
    next_token: u64,
    bound: HashMap<Group, GroupHandle>,
}

impl GroupTable {
    pub fn new() -> Self {
        GroupTable {
            inner: Mutex::new(GroupTableInner {
                next_token: 1,
                bound: HashMap::new(),
            }),
        }
    }

    /// Claim a group for this process. Returns the registration token and
    /// the shutdown signal for its consumer loop, or `None` if the group
    /// is already bound.
    pub fn try_claim(&self, group: &Group) -> Option<(u64, watch::Receiver<bool>)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bound.contains_key(group) {
            return None;
        }
        let token = inner.next_token;
        inner.next_token += 1;
        let (shutdown, receiver) = watch::channel(false);
        inner.bound.insert(group.clone(), GroupHandle { token, shutdown });
        Some((token, receiver))
    }

    /// Release the claim identified by `token`, stopping its consumer.
    /// Idempotent; a stale token never releases a newer claim.
    pub fn release(&self, group: &Group, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.bound.get(group).is_some_and(|handle| handle.token == token) {
            if let Some(handle) = inner.bound.remove(group) {
                let _ = handle.shutdown.send(true);
            }
        }
    }

    pub fn contains(&self, group: &Group) -> bool {
        self.inner.lock().unwrap().bound.contains_key(group)
    }

    /// Groups currently bound in this process.
    pub fn bound(&self) -> BTreeSet<Group> {
        self.inner.lock().unwrap().bound.keys().cloned().collect()
    }

    /// Stop every consumer. Used at bus shutdown.
    pub fn release_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, handle) in inner.bound.drain() {
            let _ = handle.shutdown.send(true);
        }
    }
}

/// One group's consumer: pulls deliveries under the throttle's credit
/// budget and applies the retry/backoff/dead-letter policy around each
/// listener invocation.
pub(crate) struct GroupConsumer {
    group: Group,
    listener: Arc<dyn EventListener>,
    broker: Arc<dyn BrokerTransport>,
    serializer: Arc<dyn EventSerializer>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry: RetryBackoff,
    execution_rate: usize,
}

impl GroupConsumer {
    pub fn new(
        group: Group,
        listener: Arc<dyn EventListener>,
        broker: Arc<dyn BrokerTransport>,
        serializer: Arc<dyn EventSerializer>,
        dead_letters: Arc<dyn DeadLetterStore>,
        retry: RetryBackoff,
        execution_rate: usize,
    ) -> Self {
        GroupConsumer {
            group,
            listener,
            broker,
            serializer,
            dead_letters,
            retry,
            execution_rate,
        }
    }

    /// Pump deliveries until shutdown is signalled or the queue is
    /// deleted. Each delivery is processed in its own task so a scheduled
    /// backoff never blocks sibling deliveries.
    pub async fn run(self, mut source: Box<dyn DeliverySource>, mut shutdown: watch::Receiver<bool>) {
        let mut throttle = DeliveryThrottle::new(self.execution_rate);
        let mut credits = throttle.rate();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(self);
        debug!(group = %consumer.group, rate = credits, "group consumer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(sample) = done_rx.recv() => {
                    credits += match sample {
                        Some(latency) => throttle.record(latency),
                        None => 1,
                    };
                }
                delivery = source.next(), if credits > 0 => {
                    let Some(delivery) = delivery else {
                        debug!(group = %consumer.group, "queue deleted, consumer stopping");
                        break;
                    };
                    credits -= 1;
                    let worker = Arc::clone(&consumer);
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let sample = worker.process(delivery).await;
                        let _ = done.send(sample);
                    });
                }
            }
        }
        debug!(group = %consumer.group, "group consumer stopped");
    }

    /// Handle one delivery to terminal state. Returns the listener latency
    /// sample, if an invocation happened.
    async fn process(&self, delivery: Delivery) -> Option<std::time::Duration> {
        let retry_count = delivery.retry_count();
        let event = match self.serializer.from_bytes(&delivery.message().payload) {
            Ok(event) => event,
            Err(codec_error) => {
                warn!(group = %self.group, %codec_error, "dropping undecodable delivery");
                if let Err(ack_error) = delivery.ack().await {
                    warn!(group = %self.group, %ack_error, "failed to ack poison delivery");
                }
                return None;
            }
        };

        if retry_count > 0 {
            let delay = self.retry.delay_before(retry_count);
            debug!(
                group = %self.group,
                event = %event.id(),
                retry_count,
                ?delay,
                "delaying retried delivery"
            );
            sleep(delay).await;
        }

        let started = Instant::now();
        let result = self.listener.handle(&event).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                if let Err(ack_error) = delivery.ack().await {
                    warn!(group = %self.group, %ack_error, "failed to ack processed delivery");
                }
            }
            Err(error) if retry_count < self.retry.max_retries() => {
                let next = delivery.message().retried();
                warn!(
                    group = %self.group,
                    event = %event.id(),
                    retry_count = next.retry_count,
                    %error,
                    "listener failed, scheduling retry"
                );
                match self.broker.publish_to_group(&self.group, next).await {
                    Ok(()) => {
                        if let Err(ack_error) = delivery.ack().await {
                            warn!(group = %self.group, %ack_error, "failed to ack retried delivery");
                        }
                    }
                    Err(publish_error) => {
                        // Leave the delivery unacknowledged: the broker
                        // redelivers the original with the same counter.
                        warn!(
                            group = %self.group,
                            event = %event.id(),
                            %publish_error,
                            "failed to re-publish retry, relying on redelivery"
                        );
                    }
                }
            }
            Err(error) => {
                error!(
                    group = %self.group,
                    event = %event.id(),
                    %error,
                    "retries exhausted, dead-lettering event"
                );
                let entry = DeadLetterEntry::new(self.group.clone(), event, error.to_string());
                if let Err(store_error) = self.dead_letters.store(entry).await {
                    error!(group = %self.group, %store_error, "failed to store dead letter");
                }
                if let Err(ack_error) = delivery.ack().await {
                    warn!(group = %self.group, %ack_error, "failed to ack dead-lettered delivery");
                }
            }
        }
        Some(latency)
    }
}
