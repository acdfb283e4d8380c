//! In-memory broker for testing and single-process deployments.
//!
//! Implements the full wire contract: broadcast fan-out to every declared
//! group queue, competing consumers on one queue, and redelivery of
//! deliveries that were never acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::transport::{
    Acknowledge, BrokerError, BrokerTransport, Delivery, DeliverySource, WireMessage,
};
use crate::event::Group;

struct QueueState {
    ready: VecDeque<WireMessage>,
    deleted: bool,
}

struct GroupQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl GroupQueue {
    fn new() -> Self {
        GroupQueue {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                deleted: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: WireMessage) {
        let mut state = self.state.lock().unwrap();
        if !state.deleted {
            state.ready.push_back(message);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    // Redelivered messages go back to the head, ahead of newer traffic.
    fn requeue(&self, message: WireMessage) {
        let mut state = self.state.lock().unwrap();
        if !state.deleted {
            state.ready.push_front(message);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Thread-safe in-memory broker. Clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<GroupQueue>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn queue(&self, group: &Group) -> Option<Arc<GroupQueue>> {
        self.queues.lock().unwrap().get(&group.queue_name()).cloned()
    }

    /// Names of all declared queues, sorted.
    pub fn declared_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of ready (undelivered) messages in a group's queue.
    pub fn depth(&self, group: &Group) -> usize {
        self.queue(group)
            .map(|queue| queue.state.lock().unwrap().ready.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn declare_group_queue(&self, group: &Group) -> Result<(), BrokerError> {
        self.queues
            .lock()
            .unwrap()
            .entry(group.queue_name())
            .or_insert_with(|| Arc::new(GroupQueue::new()));
        Ok(())
    }

    async fn publish(&self, message: WireMessage) -> Result<(), BrokerError> {
        let queues: Vec<Arc<GroupQueue>> =
            self.queues.lock().unwrap().values().cloned().collect();
        for queue in queues {
            queue.push_back(message.clone());
        }
        Ok(())
    }

    async fn publish_to_group(
        &self,
        group: &Group,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        let queue = self
            .queue(group)
            .ok_or_else(|| BrokerError::QueueUnavailable(group.queue_name()))?;
        queue.push_back(message);
        Ok(())
    }

    async fn consume(&self, group: &Group) -> Result<Box<dyn DeliverySource>, BrokerError> {
        let queue = self
            .queue(group)
            .ok_or_else(|| BrokerError::QueueUnavailable(group.queue_name()))?;
        Ok(Box::new(InMemorySource { queue }))
    }

    async fn delete_group_queue(&self, group: &Group) -> Result<(), BrokerError> {
        let removed = self.queues.lock().unwrap().remove(&group.queue_name());
        if let Some(queue) = removed {
            queue.state.lock().unwrap().deleted = true;
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

struct InMemorySource {
    queue: Arc<GroupQueue>,
}

#[async_trait]
impl DeliverySource for InMemorySource {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut state = self.queue.state.lock().unwrap();
                if state.deleted {
                    return None;
                }
                if let Some(message) = state.ready.pop_front() {
                    let ack = InMemoryAck {
                        queue: Arc::clone(&self.queue),
                        pending: Some(message.clone()),
                    };
                    return Some(Delivery::new(message, Box::new(ack)));
                }
            }
            notified.await;
        }
    }
}

struct InMemoryAck {
    queue: Arc<GroupQueue>,
    pending: Option<WireMessage>,
}

#[async_trait]
impl Acknowledge for InMemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.pending = None;
        Ok(())
    }
}

impl Drop for InMemoryAck {
    fn drop(&mut self) {
        if let Some(message) = self.pending.take() {
            self.queue.requeue(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(payload: &[u8]) -> WireMessage {
        WireMessage::new(payload.to_vec())
    }

    #[tokio::test]
    async fn broadcast_reaches_every_declared_queue() {
        let broker = InMemoryBroker::new();
        let indexer = Group::new("search-indexer");
        let quota = Group::new("quota-tracker");
        broker.declare_group_queue(&indexer).await.unwrap();
        broker.declare_group_queue(&quota).await.unwrap();

        broker.publish(message(b"e1")).await.unwrap();

        assert_eq!(broker.depth(&indexer), 1);
        assert_eq!(broker.depth(&quota), 1);
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        let group = Group::new("search-indexer");
        broker.declare_group_queue(&group).await.unwrap();
        broker.publish(message(b"e1")).await.unwrap();
        broker.declare_group_queue(&group).await.unwrap();
        assert_eq!(broker.depth(&group), 1);
    }

    #[tokio::test]
    async fn competing_consumers_split_the_queue() {
        let broker = InMemoryBroker::new();
        let group = Group::new("search-indexer");
        broker.declare_group_queue(&group).await.unwrap();
        broker.publish(message(b"e1")).await.unwrap();
        broker.publish(message(b"e2")).await.unwrap();

        let mut one = broker.consume(&group).await.unwrap();
        let mut two = broker.consume(&group).await.unwrap();

        let first = one.next().await.unwrap();
        let second = two.next().await.unwrap();
        assert_ne!(first.message().payload, second.message().payload);
        first.ack().await.unwrap();
        second.ack().await.unwrap();
        assert_eq!(broker.depth(&group), 0);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        let group = Group::new("search-indexer");
        broker.declare_group_queue(&group).await.unwrap();
        broker.publish(message(b"e1")).await.unwrap();

        {
            let mut source = broker.consume(&group).await.unwrap();
            let delivery = source.next().await.unwrap();
            assert_eq!(delivery.message().payload, b"e1");
            // Dropped without ack: the consumer crashed mid-flight.
        }

        let mut survivor = broker.consume(&group).await.unwrap();
        let redelivered = survivor.next().await.unwrap();
        assert_eq!(redelivered.message().payload, b"e1");
        redelivered.ack().await.unwrap();
        assert_eq!(broker.depth(&group), 0);
    }

    #[tokio::test]
    async fn publish_to_group_targets_one_queue() {
        let broker = InMemoryBroker::new();
        let indexer = Group::new("search-indexer");
        let quota = Group::new("quota-tracker");
        broker.declare_group_queue(&indexer).await.unwrap();
        broker.declare_group_queue(&quota).await.unwrap();

        let mut retried = message(b"e1");
        retried.retry_count = 2;
        broker.publish_to_group(&indexer, retried).await.unwrap();

        assert_eq!(broker.depth(&indexer), 1);
        assert_eq!(broker.depth(&quota), 0);
    }

    #[tokio::test]
    async fn publish_to_missing_group_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish_to_group(&Group::new("nobody"), message(b"e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn delete_wakes_blocked_consumers() {
        let broker = InMemoryBroker::new();
        let group = Group::new("search-indexer");
        broker.declare_group_queue(&group).await.unwrap();
        let mut source = broker.consume(&group).await.unwrap();

        let waiter = tokio::spawn(async move { source.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.delete_group_queue(&group).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
        assert!(broker.declared_queues().is_empty());
    }

    #[tokio::test]
    async fn waiting_consumer_sees_late_publish() {
        let broker = InMemoryBroker::new();
        let group = Group::new("search-indexer");
        broker.declare_group_queue(&group).await.unwrap();
        let mut source = broker.consume(&group).await.unwrap();

        let waiter = tokio::spawn(async move {
            let delivery = source.next().await.unwrap();
            delivery.message().payload.clone()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish(message(b"late")).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"late");
    }
}
