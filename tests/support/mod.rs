// Not every integration target uses every helper.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mailbus::{Event, EventId, EventListener, ExecutionMode, ListenerError, RegistrationKey};

/// Listener that records every invocation and can be told to fail the
/// first N attempts (or all of them).
pub struct RecordingListener {
    mode: ExecutionMode,
    fail_first: u32,
    calls: AtomicU32,
    seen: Mutex<Vec<EventId>>,
}

impl RecordingListener {
    pub fn new(mode: ExecutionMode) -> Arc<Self> {
        Self::failing(mode, 0)
    }

    pub fn failing(mode: ExecutionMode, fail_first: u32) -> Arc<Self> {
        Arc::new(RecordingListener {
            mode,
            fail_first,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing(mode: ExecutionMode) -> Arc<Self> {
        Self::failing(mode, u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<EventId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn handle(&self, event: &Event) -> Result<(), ListenerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(event.id());
        if call < self.fail_first {
            Err("induced listener failure".into())
        } else {
            Ok(())
        }
    }
}

pub fn keys(names: &[&str]) -> BTreeSet<RegistrationKey> {
    names.iter().map(|n| RegistrationKey::new(*n)).collect()
}

pub fn event(user: &str, kind: &str) -> Event {
    Event::new(user, kind, vec![])
}

/// Give background consumer loops time to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
