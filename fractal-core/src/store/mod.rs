//! Persistence seam for entities, channels and queue-owned records.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Channel, Checkpoint, DeviceCredentials, DurableOperation, Entity, EntityKind, Instance,
    InstanceKind, InstanceRef, Metadata, ReplicationLogEntry, RepresentationLogEntry,
};

/// Every record written by one logical mutation. A store applies a change
/// set atomically: all rows land or none do.
///
/// Rows are upserts keyed by id. Marking a log consumed is an upsert of the
/// same row with `deleted` set.
///
/// Entity and channel upserts never lower `object_version`: a row older than
/// the stored one is skipped, and a row that lands keeps any metadata keys
/// only the stored copy holds. Metadata patches are merged into whatever
/// version is stored when the change set commits.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub entities: Vec<Entity>,
    pub channels: Vec<Channel>,
    pub metadata_patches: Vec<(InstanceRef, Metadata)>,
    pub credentials: Vec<DeviceCredentials>,
    pub replication_logs: Vec<ReplicationLogEntry>,
    pub representation_logs: Vec<RepresentationLogEntry>,
    pub operations: Vec<DurableOperation>,
    pub checkpoints: Vec<Checkpoint>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.channels.is_empty()
            && self.metadata_patches.is_empty()
            && self.credentials.is_empty()
            && self.replication_logs.is_empty()
            && self.representation_logs.is_empty()
            && self.operations.is_empty()
            && self.checkpoints.is_empty()
    }

    /// Queues `patch` for merging into the stored metadata of `target`.
    pub fn patch_metadata(&mut self, target: InstanceRef, patch: Metadata) {
        self.metadata_patches.push((target, patch));
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Writes a change set in one transaction. New queue rows get the next
    /// `seq`; existing rows keep theirs.
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;

    async fn entity(&self, id: Uuid) -> Result<Option<Entity>, StoreError>;

    /// All live entities of `kind`.
    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError>;

    /// Live entities of `kind` whose parent is `parent_id`.
    async fn children(&self, parent_id: Uuid, kind: EntityKind) -> Result<Vec<Entity>, StoreError>;

    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError>;

    /// Channels bound to a database, origin first.
    async fn channels(&self, database_id: Uuid) -> Result<Vec<Channel>, StoreError>;

    async fn device_credentials(
        &self,
        device_id: Uuid,
        endpoint: &str,
    ) -> Result<Option<DeviceCredentials>, StoreError>;

    /// Unconsumed replication log entries of a channel in creation order.
    async fn pending_replication_logs(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<ReplicationLogEntry>, StoreError>;

    /// Unapplied representation steps of one replication log entry in
    /// creation order.
    async fn pending_representation_logs(
        &self,
        replication_log_id: Uuid,
    ) -> Result<Vec<RepresentationLogEntry>, StoreError>;

    /// Pending durable operations of a channel in creation order.
    async fn pending_operations(&self, channel_id: Uuid)
        -> Result<Vec<DurableOperation>, StoreError>;

    async fn operation(&self, id: Uuid) -> Result<Option<DurableOperation>, StoreError>;

    async fn checkpoint(
        &self,
        queue: &str,
        device_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Loads whatever `reference` points at.
    async fn instance(&self, reference: InstanceRef) -> Result<Instance, StoreError> {
        let missing = || StoreError::NotFound(reference.to_string());
        match reference.kind {
            InstanceKind::Channel => self
                .channel(reference.id)
                .await?
                .map(Instance::Channel)
                .ok_or_else(missing),
            kind => {
                let entity = self.entity(reference.id).await?.ok_or_else(missing)?;
                if Some(entity.kind) != kind.entity_kind() {
                    return Err(missing());
                }
                Ok(Instance::Entity(entity))
            }
        }
    }

    /// The origin channel of a database, if one was added.
    async fn origin_channel(&self, database_id: Uuid) -> Result<Option<Channel>, StoreError> {
        Ok(self
            .channels(database_id)
            .await?
            .into_iter()
            .find(|channel| channel.origin && !channel.deleted))
    }
}
