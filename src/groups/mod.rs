mod aggregate;
mod convergence;

pub use aggregate::{
    AggregateReplayError, GroupsChanged, RegisteredGroupsAggregate, REGISTERED_GROUPS_AGGREGATE_ID,
};
pub use convergence::{apply_groups_changed, ConvergenceError, GroupRegistry, GroupUnbinder};
