mod channel;
mod entity;
mod fixture;
mod instance;
mod log;
pub mod metadata;

pub use channel::{Channel, CHANNEL_MODEL};
pub use entity::{Entity, EntityKind, Namespace};
pub use fixture::FixtureEntry;
pub use instance::{Instance, InstanceKind, InstanceRef};
pub use log::{
    Checkpoint, DeviceCredentials, DurableOperation, OperationKind, OperationStatus,
    ReplicationLogEntry, RepresentationLogEntry,
};
pub use metadata::Metadata;
