use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChangeSet, Store};
use crate::error::StoreError;
use crate::models::{
    Channel, Checkpoint, DeviceCredentials, DurableOperation, Entity, EntityKind, InstanceKind,
    ReplicationLogEntry, RepresentationLogEntry,
};

#[derive(Default)]
struct Tables {
    next_seq: i64,
    entities: HashMap<Uuid, Entity>,
    channels: HashMap<Uuid, Channel>,
    credentials: HashMap<(Uuid, String), DeviceCredentials>,
    replication_logs: HashMap<Uuid, ReplicationLogEntry>,
    representation_logs: HashMap<Uuid, RepresentationLogEntry>,
    operations: HashMap<Uuid, DurableOperation>,
    checkpoints: HashMap<(String, Uuid), Checkpoint>,
}

impl Tables {
    fn seq_for(&mut self, existing: Option<i64>) -> i64 {
        match existing {
            Some(seq) => seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        }
    }
}

/// In-process store. A single write lock per commit makes change sets atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every durable operation ever committed, in creation order.
    pub async fn all_operations(&self) -> Vec<DurableOperation> {
        let tables = self.tables.read().await;
        let mut operations: Vec<_> = tables.operations.values().cloned().collect();
        operations.sort_by_key(|op| op.seq);
        operations
    }

    /// Every replication log entry, consumed or not, in creation order.
    pub async fn all_replication_logs(&self) -> Vec<ReplicationLogEntry> {
        let tables = self.tables.read().await;
        let mut logs: Vec<_> = tables.replication_logs.values().cloned().collect();
        logs.sort_by_key(|log| log.seq);
        logs
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        for (target, _) in &changes.metadata_patches {
            let known = match target.kind {
                InstanceKind::Channel => {
                    tables.channels.contains_key(&target.id)
                        || changes.channels.iter().any(|c| c.id == target.id)
                }
                _ => {
                    tables.entities.contains_key(&target.id)
                        || changes.entities.iter().any(|e| e.id == target.id)
                }
            };
            if !known {
                return Err(StoreError::NotFound(target.to_string()));
            }
        }

        for mut entity in changes.entities {
            if let Some(stored) = tables.entities.get(&entity.id) {
                if stored.object_version > entity.object_version {
                    continue;
                }
                entity.metadata.fill_missing(&stored.metadata);
            }
            tables.entities.insert(entity.id, entity);
        }
        for mut channel in changes.channels {
            if let Some(stored) = tables.channels.get(&channel.id) {
                if stored.object_version > channel.object_version {
                    continue;
                }
                channel.metadata.fill_missing(&stored.metadata);
            }
            tables.channels.insert(channel.id, channel);
        }
        for (target, patch) in &changes.metadata_patches {
            let metadata = match target.kind {
                InstanceKind::Channel => {
                    tables.channels.get_mut(&target.id).map(|c| &mut c.metadata)
                }
                _ => tables.entities.get_mut(&target.id).map(|e| &mut e.metadata),
            };
            if let Some(metadata) = metadata {
                metadata.merge(patch);
            }
        }
        for creds in changes.credentials {
            tables
                .credentials
                .insert((creds.device_id, creds.endpoint.clone()), creds);
        }
        for mut log in changes.replication_logs {
            let existing = tables.replication_logs.get(&log.id).map(|l| l.seq);
            log.seq = tables.seq_for(existing);
            tables.replication_logs.insert(log.id, log);
        }
        for mut log in changes.representation_logs {
            let existing = tables.representation_logs.get(&log.id).map(|l| l.seq);
            log.seq = tables.seq_for(existing);
            tables.representation_logs.insert(log.id, log);
        }
        for mut op in changes.operations {
            let existing = tables.operations.get(&op.id).map(|o| o.seq);
            op.seq = tables.seq_for(existing);
            tables.operations.insert(op.id, op);
        }
        for checkpoint in changes.checkpoints {
            tables.checkpoints.insert(
                (checkpoint.queue.clone(), checkpoint.device_id),
                checkpoint,
            );
        }
        Ok(())
    }

    async fn entity(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        Ok(self.tables.read().await.entities.get(&id).cloned())
    }

    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        let tables = self.tables.read().await;
        let mut found: Vec<_> = tables
            .entities
            .values()
            .filter(|e| e.kind == kind && !e.deleted)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn children(&self, parent_id: Uuid, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities(kind)
            .await?
            .into_iter()
            .filter(|e| e.parent_id == Some(parent_id))
            .collect())
    }

    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError> {
        Ok(self.tables.read().await.channels.get(&id).cloned())
    }

    async fn channels(&self, database_id: Uuid) -> Result<Vec<Channel>, StoreError> {
        let tables = self.tables.read().await;
        let mut found: Vec<_> = tables
            .channels
            .values()
            .filter(|c| c.database_id == database_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.origin.cmp(&a.origin).then(a.name.cmp(&b.name)));
        Ok(found)
    }

    async fn device_credentials(
        &self,
        device_id: Uuid,
        endpoint: &str,
    ) -> Result<Option<DeviceCredentials>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .credentials
            .get(&(device_id, endpoint.to_string()))
            .cloned())
    }

    async fn pending_replication_logs(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<ReplicationLogEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut logs: Vec<_> = tables
            .replication_logs
            .values()
            .filter(|log| log.channel_id == channel_id && !log.deleted)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.seq);
        Ok(logs)
    }

    async fn pending_representation_logs(
        &self,
        replication_log_id: Uuid,
    ) -> Result<Vec<RepresentationLogEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut logs: Vec<_> = tables
            .representation_logs
            .values()
            .filter(|log| log.replication_log_id == replication_log_id && !log.deleted)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.seq);
        Ok(logs)
    }

    async fn pending_operations(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<DurableOperation>, StoreError> {
        let tables = self.tables.read().await;
        let mut ops: Vec<_> = tables
            .operations
            .values()
            .filter(|op| op.channel_id == channel_id && op.is_pending())
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    async fn operation(&self, id: Uuid) -> Result<Option<DurableOperation>, StoreError> {
        Ok(self.tables.read().await.operations.get(&id).cloned())
    }

    async fn checkpoint(
        &self,
        queue: &str,
        device_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .checkpoints
            .get(&(queue.to_string(), device_id))
            .cloned())
    }
}
