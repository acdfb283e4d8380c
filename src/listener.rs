use async_trait::async_trait;

use crate::event::Event;

/// Error returned by a listener body. Opaque to the bus.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// How a listener's invocations relate to the dispatching caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The dispatch call completes only after this listener has run; its
    /// failure surfaces in the dispatch outcome.
    Synchronous,
    /// Fire-and-forget with respect to the caller; failures are handled by
    /// the retry subsystem and never reach the producer.
    Asynchronous,
}

/// A handler for bus events.
///
/// The execution mode is a capability declared by the listener itself; the
/// dispatcher branches on it, never on the listener's concrete type.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Synchronous
    }

    async fn handle(&self, event: &Event) -> Result<(), ListenerError>;
}
