//! In-process fan-out to key-registered listeners.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::registry::KeyRegistry;
use super::tasks::TaskGroup;
use crate::event::{Event, RegistrationKey};
use crate::listener::{EventListener, ExecutionMode, ListenerError};
use crate::retry::RetryBackoff;

/// One synchronous listener's failure, attributed to the key it was
/// registered under.
#[derive(Debug)]
pub struct ListenerFailure {
    pub key: RegistrationKey,
    pub error: ListenerError,
}

/// Aggregated error channel for the dispatch caller.
#[derive(Debug)]
pub struct DispatchError {
    pub failures: Vec<ListenerFailure>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener(s) failed during dispatch", self.failures.len())
    }
}

impl std::error::Error for DispatchError {}

/// Per-listener outcomes of one dispatch call, folded into a single
/// completion signal.
///
/// Covers synchronous listeners only; asynchronous listeners are
/// fire-and-forget with respect to the caller.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Synchronous listeners that were invoked.
    pub sync_listeners: usize,
    /// Asynchronous listeners handed to the worker pool.
    pub async_listeners: usize,
    /// Failures of synchronous listeners, in invocation order.
    pub failures: Vec<ListenerFailure>,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<(), DispatchError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError {
                failures: self.failures,
            })
        }
    }
}

/// Delivers one event to the local listeners whose key intersects the
/// dispatched key set.
pub(crate) struct LocalDispatcher {
    registry: Arc<KeyRegistry>,
    tasks: Arc<TaskGroup>,
    retry: RetryBackoff,
}

impl LocalDispatcher {
    pub fn new(registry: Arc<KeyRegistry>, tasks: Arc<TaskGroup>, retry: RetryBackoff) -> Self {
        LocalDispatcher {
            registry,
            tasks,
            retry,
        }
    }

    /// Invoke every matching listener. Synchronous ones run here, in
    /// registration order per key; their failures are collected without
    /// stopping the rest. Asynchronous ones are spawned and retried
    /// internally, never surfacing to the caller.
    pub async fn dispatch(
        &self,
        event: &Arc<Event>,
        keys: &BTreeSet<RegistrationKey>,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        if keys.is_empty() {
            return outcome;
        }

        for (key, listener) in self.registry.snapshot(keys) {
            match listener.execution_mode() {
                ExecutionMode::Synchronous => {
                    outcome.sync_listeners += 1;
                    if let Err(error) = listener.handle(event).await {
                        debug!(key = %key, event = %event.id(), "synchronous listener failed");
                        outcome.failures.push(ListenerFailure { key, error });
                    }
                }
                ExecutionMode::Asynchronous => {
                    outcome.async_listeners += 1;
                    self.spawn_async(key, listener, Arc::clone(event));
                }
            }
        }
        outcome
    }

    fn spawn_async(
        &self,
        key: RegistrationKey,
        listener: Arc<dyn EventListener>,
        event: Arc<Event>,
    ) {
        let retry = self.retry;
        self.tasks.spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                match listener.handle(&event).await {
                    Ok(()) => return,
                    Err(error) => {
                        if attempt >= retry.max_retries() {
                            error!(
                                key = %key,
                                event = %event.id(),
                                %error,
                                "asynchronous listener exhausted retries, dropping event"
                            );
                            return;
                        }
                        attempt += 1;
                        let delay = retry.delay_before(attempt);
                        warn!(
                            key = %key,
                            event = %event.id(),
                            attempt,
                            ?delay,
                            "asynchronous listener failed, retrying"
                        );
                        sleep(delay).await;
                    }
                }
            }
        });
    }
}
