//! Checkpointed multi-queue consumer.
//!
//! A [`Broker`] long-polls the rooms bound to a device and yields batches of
//! tasks; a [`Worker`] runs them and acknowledges each one, moving the
//! queue's checkpoint forward.

mod broker;
mod queue;
mod worker;

pub use broker::{Broker, DEFAULT_FETCH_TIMEOUT, LOCK_ALIAS_PREFIX};
pub use queue::{dedupe_tasks, prune_tasks, QueueBinding, QueueKind, ReceivedTask};
pub use worker::Worker;
