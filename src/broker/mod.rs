mod in_memory;
mod transport;

pub use in_memory::InMemoryBroker;
pub use transport::{
    Acknowledge, BrokerError, BrokerTransport, Delivery, DeliverySource, WireMessage,
};
