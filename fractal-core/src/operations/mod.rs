//! Durable operation graph: plan idempotent transport side effects, then run
//! them in creation order.

mod executor;
pub mod kinds;
mod planner;

pub use executor::{Executor, RunSummary};
pub use kinds::{plan, run, RunEnv, RunOutput};
pub use planner::{
    load_members, plan_database, plan_device_membership, plan_first_appearance,
    plan_nested_database, Member,
};
