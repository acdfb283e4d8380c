mod dispatcher;
mod registry;
mod tasks;

pub use dispatcher::{DispatchError, DispatchOutcome, ListenerFailure};

pub(crate) use dispatcher::LocalDispatcher;
pub(crate) use registry::KeyRegistry;
pub(crate) use tasks::TaskGroup;
