//! Protocol-level broker contract, independent of any vendor.
//!
//! One broadcast channel fans out to every group queue; each queue name is
//! a deterministic function of the group's name; deliveries carry a
//! retry-count header; manual acknowledgement is mandatory.

use std::error::Error;
use std::fmt;

use async_trait::async_trait;

use crate::event::Group;

/// An event in wire form: the serialized payload plus the delivery headers
/// the protocol requires (at least the retry counter).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub payload: Vec<u8>,
    pub retry_count: u32,
}

impl WireMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        WireMessage {
            payload,
            retry_count: 0,
        }
    }

    /// The same payload, one retry later. The counter travels inside the
    /// message so the retry loop survives process restarts.
    pub fn retried(&self) -> Self {
        WireMessage {
            payload: self.payload.clone(),
            retry_count: self.retry_count + 1,
        }
    }
}

/// Error type for broker operations.
#[derive(Debug)]
pub enum BrokerError {
    /// Connection to the broker failed
    ConnectionFailed(String),
    /// The target queue does not exist (not declared, or deleted)
    QueueUnavailable(String),
    /// The broker rejected the message
    Rejected(String),
    /// Timeout waiting for the broker
    Timeout,
    /// Other error
    Other(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            BrokerError::QueueUnavailable(queue) => write!(f, "Queue unavailable: {}", queue),
            BrokerError::Rejected(msg) => write!(f, "Message rejected: {}", msg),
            BrokerError::Timeout => write!(f, "Broker timeout"),
            BrokerError::Other(e) => write!(f, "Broker error: {}", e),
        }
    }
}

impl Error for BrokerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BrokerError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Acknowledges exactly one delivery.
///
/// Dropping the handle without acknowledging returns the delivery to its
/// queue for the next consumer, which is how crash recovery works.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message pulled from a group queue, pending acknowledgement.
pub struct Delivery {
    message: WireMessage,
    ack: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(message: WireMessage, ack: Box<dyn Acknowledge>) -> Self {
        Delivery {
            message,
            ack: Some(ack),
        }
    }

    pub fn message(&self) -> &WireMessage {
        &self.message
    }

    pub fn retry_count(&self) -> u32 {
        self.message.retry_count
    }

    /// Acknowledge the delivery. Call only after the listener invocation
    /// reached success or terminal failure.
    pub async fn ack(mut self) -> Result<(), BrokerError> {
        match self.ack.take() {
            Some(ack) => ack.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("acked", &self.ack.is_none())
            .finish()
    }
}

/// A consumer handle on one group queue.
///
/// Multiple sources on the same queue compete: each delivery goes to
/// exactly one of them.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery, waiting until one is available. `None` means the
    /// queue was deleted.
    ///
    /// Callers may drop the returned future before it resolves;
    /// implementations must not lose a delivery to a cancelled call.
    async fn next(&mut self) -> Option<Delivery>;
}

/// The underlying broker transport (queues, bindings, acknowledgement).
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Declare the durable, non-exclusive, non-auto-delete queue for
    /// `group` and bind it to the broadcast channel with no filtering.
    /// Idempotent.
    async fn declare_group_queue(&self, group: &Group) -> Result<(), BrokerError>;

    /// Publish to the broadcast channel; every bound group queue receives
    /// a copy.
    async fn publish(&self, message: WireMessage) -> Result<(), BrokerError>;

    /// Publish directly to one group's queue (the retry path).
    async fn publish_to_group(
        &self,
        group: &Group,
        message: WireMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming `group`'s queue with manual acknowledgement.
    async fn consume(&self, group: &Group) -> Result<Box<dyn DeliverySource>, BrokerError>;

    /// Delete `group`'s queue and its binding. Used by convergence to
    /// drop queues whose group is no longer required anywhere.
    async fn delete_group_queue(&self, group: &Group) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retried_increments_counter_only() {
        let message = WireMessage::new(b"payload".to_vec());
        let retried = message.retried();
        assert_eq!(retried.payload, message.payload);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.retried().retry_count, 2);
    }

    #[tokio::test]
    async fn ack_consumes_the_handle_once() {
        struct CountingAck(std::sync::Arc<std::sync::atomic::AtomicU32>);

        #[async_trait]
        impl Acknowledge for CountingAck {
            async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let acked = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let delivery = Delivery::new(
            WireMessage::new(vec![]),
            Box::new(CountingAck(acked.clone())),
        );
        delivery.ack().await.unwrap();
        assert_eq!(acked.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
