use std::fmt;
use std::sync::{Arc, Mutex};

use crate::consumer::GroupTable;
use crate::dispatch::KeyRegistry;
use crate::event::{Group, RegistrationKey};

enum Binding {
    Key {
        registry: Arc<KeyRegistry>,
        key: RegistrationKey,
        token: u64,
    },
    Group {
        table: Arc<GroupTable>,
        group: Group,
        token: u64,
    },
}

/// Handle to one listener binding, returned by every register call.
///
/// Dropping the handle does not unregister; the binding lives until
/// `unregister()` is called or the bus shuts down.
pub struct Registration {
    binding: Mutex<Option<Binding>>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .binding
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("Registration")
            .field("active", &active)
            .finish()
    }
}

impl Registration {
    pub(crate) fn for_key(registry: Arc<KeyRegistry>, key: RegistrationKey, token: u64) -> Self {
        Registration {
            binding: Mutex::new(Some(Binding::Key {
                registry,
                key,
                token,
            })),
        }
    }

    pub(crate) fn for_group(table: Arc<GroupTable>, group: Group, token: u64) -> Self {
        Registration {
            binding: Mutex::new(Some(Binding::Group {
                table,
                group,
                token,
            })),
        }
    }

    /// Remove exactly the listener binding this handle represents.
    ///
    /// Idempotent. Cancels future deliveries but never recalls one already
    /// in flight; for a group, the durable queue stays intact for other
    /// processes still serving it.
    pub fn unregister(&self) {
        if let Some(binding) = self.binding.lock().unwrap().take() {
            match binding {
                Binding::Key {
                    registry,
                    key,
                    token,
                } => registry.remove(&key, token),
                Binding::Group {
                    table,
                    group,
                    token,
                } => table.release(&group, token),
            }
        }
    }
}
