use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::event::RegistrationKey;
use crate::listener::EventListener;

struct KeyEntry {
    token: u64,
    listener: Arc<dyn EventListener>,
}

struct Inner {
    next_token: u64,
    listeners: HashMap<RegistrationKey, Vec<KeyEntry>>,
}

/// Process-local multimap from registration key to listeners.
///
/// Exclusively owned by this process; mutated only under the lock guarding
/// register, unregister and dispatch lookup. Duplicate registrations of
/// the same listener under the same key are independent entries.
pub(crate) struct KeyRegistry {
    inner: Mutex<Inner>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        KeyRegistry {
            inner: Mutex::new(Inner {
                next_token: 1,
                listeners: HashMap::new(),
            }),
        }
    }

    /// Add a listener under a key. Never fails; returns the token that
    /// identifies this one registration.
    pub fn insert(&self, key: RegistrationKey, listener: Arc<dyn EventListener>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        inner
            .listeners
            .entry(key)
            .or_default()
            .push(KeyEntry { token, listener });
        token
    }

    /// Remove exactly the registration identified by `token`. Idempotent;
    /// other registrations under the same key are untouched.
    pub fn remove(&self, key: &RegistrationKey, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.listeners.get_mut(key) {
            entries.retain(|entry| entry.token != token);
            if entries.is_empty() {
                inner.listeners.remove(key);
            }
        }
    }

    /// Listeners whose key intersects `keys`, in registration order within
    /// each key. Snapshotted so an unregister during dispatch never recalls
    /// an in-flight delivery.
    pub fn snapshot(
        &self,
        keys: &BTreeSet<RegistrationKey>,
    ) -> Vec<(RegistrationKey, Arc<dyn EventListener>)> {
        let inner = self.inner.lock().unwrap();
        let mut matched = Vec::new();
        for key in keys {
            if let Some(entries) = inner.listeners.get(key) {
                for entry in entries {
                    matched.push((key.clone(), Arc::clone(&entry.listener)));
                }
            }
        }
        matched
    }

    #[cfg(test)]
    fn count(&self, key: &RegistrationKey) -> usize {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
