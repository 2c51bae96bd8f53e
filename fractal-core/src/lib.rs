//! Fractal Core Library
//!
//! Replicates a local database of entities to remote destinations over a
//! room-based broadcast transport. Local changes are logged, their structure
//! is realized as a hierarchy of spaces and rooms through durable operations,
//! and pruned fixtures are broadcast as tasks that every device consumes
//! from checkpointed queues.

pub mod consumer;
pub mod context;
pub mod error;
pub mod models;
pub mod mutations;
pub mod operations;
pub mod replication;
pub mod representation;
pub mod retry;
pub mod store;
pub mod task;
pub mod transport;

pub use consumer::{Broker, QueueBinding, QueueKind, ReceivedTask, Worker};
pub use context::{Credentials, ReplicationContext};
pub use error::{ReplicationError, Result, StoreError, TransportError};
pub use models::{
    Channel, Checkpoint, DeviceCredentials, DurableOperation, Entity, EntityKind, FixtureEntry,
    Instance, InstanceKind, InstanceRef, Metadata, OperationKind, OperationStatus,
    ReplicationLogEntry, RepresentationLogEntry,
};
pub use mutations::{add_channel, save_entity, ChannelAdded};
pub use operations::{Executor, RunSummary};
pub use replication::{apply_fixture, encode_fixture, prune, ApplyReport, Pipeline, PushReport};
pub use representation::HierarchyBuilder;
pub use retry::RetryPolicy;
pub use store::{ChangeSet, MemoryStore, Store};
pub use task::{Task, TaskDispatcher};
pub use transport::{MemoryTransport, Transport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
