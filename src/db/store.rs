use async_trait::async_trait;
use chrono::Utc;
use fractal_core::models::{
    Channel, Checkpoint, DeviceCredentials, DurableOperation, Entity, EntityKind, InstanceKind,
    InstanceRef, Metadata, OperationStatus, ReplicationLogEntry, RepresentationLogEntry,
};
use fractal_core::store::{ChangeSet, Store};
use fractal_core::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

/// [`Store`] backed by SQLite.
///
/// Records are kept as JSON in a `data` column next to the columns queries
/// filter on. Log and operation tables order by an autoincrement `seq` that an
/// upsert leaves untouched.
///
/// Commits are serialized so an entity or channel row is read and written
/// back within one writer.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

#[derive(sqlx::FromRow)]
struct DataRow {
    data: String,
}

#[derive(sqlx::FromRow)]
struct SeqRow {
    seq: i64,
    data: String,
}

#[derive(sqlx::FromRow)]
struct CredentialsRow {
    device_id: String,
    endpoint: String,
    account_id: String,
    access_token: String,
    password: String,
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    queue: String,
    device_id: String,
    cursor: Option<String>,
    date_modified: String,
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn encode<T: Serialize>(record: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(record)?)
}

fn decode<T: DeserializeOwned>(data: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(data)?)
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    async fn stored_data(
        tx: &mut Transaction<'_, Sqlite>,
        table: &str,
        id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<DataRow> = sqlx::query_as(&format!("SELECT data FROM {} WHERE id = ?", table))
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error)?;
        Ok(row.map(|row| row.data))
    }

    /// Upserts `entity` unless a newer version is stored. Metadata keys only
    /// the stored row holds are kept.
    async fn write_entity(tx: &mut Transaction<'_, Sqlite>, entity: &Entity) -> Result<(), StoreError> {
        let mut entity = entity.clone();
        if let Some(data) = Self::stored_data(tx, "entities", entity.id).await? {
            let stored: Entity = decode(&data)?;
            if stored.object_version > entity.object_version {
                return Ok(());
            }
            entity.metadata.fill_missing(&stored.metadata);
        }
        sqlx::query(
            r#"
            INSERT INTO entities (id, kind, name, parent_id, object_version, deleted, data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                parent_id = excluded.parent_id,
                object_version = excluded.object_version,
                deleted = excluded.deleted,
                data = excluded.data
            WHERE excluded.object_version >= entities.object_version
            "#,
        )
        .bind(entity.id.to_string())
        .bind(entity.kind.model_name())
        .bind(&entity.name)
        .bind(entity.parent_id.map(|id| id.to_string()))
        .bind(entity.object_version as i64)
        .bind(entity.deleted)
        .bind(encode(&entity)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn write_channel(tx: &mut Transaction<'_, Sqlite>, channel: &Channel) -> Result<(), StoreError> {
        let mut channel = channel.clone();
        if let Some(data) = Self::stored_data(tx, "channels", channel.id).await? {
            let stored: Channel = decode(&data)?;
            if stored.object_version > channel.object_version {
                return Ok(());
            }
            channel.metadata.fill_missing(&stored.metadata);
        }
        sqlx::query(
            r#"
            INSERT INTO channels (id, database_id, name, origin, object_version, data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                database_id = excluded.database_id,
                name = excluded.name,
                origin = excluded.origin,
                object_version = excluded.object_version,
                data = excluded.data
            WHERE excluded.object_version >= channels.object_version
            "#,
        )
        .bind(channel.id.to_string())
        .bind(channel.database_id.to_string())
        .bind(&channel.name)
        .bind(channel.origin)
        .bind(channel.object_version as i64)
        .bind(encode(&channel)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    /// Merges `patch` into the stored metadata of `target`, leaving every
    /// other field as stored.
    async fn apply_patch(
        tx: &mut Transaction<'_, Sqlite>,
        target: &InstanceRef,
        patch: &Metadata,
    ) -> Result<(), StoreError> {
        let table = if target.kind == InstanceKind::Channel {
            "channels"
        } else {
            "entities"
        };
        let data = Self::stored_data(tx, table, target.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        let data = if target.kind == InstanceKind::Channel {
            let mut channel: Channel = decode(&data)?;
            channel.metadata.merge(patch);
            encode(&channel)?
        } else {
            let mut entity: Entity = decode(&data)?;
            entity.metadata.merge(patch);
            encode(&entity)?
        };
        sqlx::query(&format!("UPDATE {} SET data = ? WHERE id = ?", table))
            .bind(data)
            .bind(target.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn write_credentials(
        tx: &mut Transaction<'_, Sqlite>,
        creds: &DeviceCredentials,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO device_credentials (device_id, endpoint, account_id, access_token, password)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id, endpoint) DO UPDATE SET
                account_id = excluded.account_id,
                access_token = excluded.access_token,
                password = excluded.password
            "#,
        )
        .bind(creds.device_id.to_string())
        .bind(&creds.endpoint)
        .bind(&creds.account_id)
        .bind(&creds.access_token)
        .bind(&creds.password)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn write_replication_log(
        tx: &mut Transaction<'_, Sqlite>,
        log: &ReplicationLogEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO replication_logs (id, txn_id, channel_id, deleted, data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                deleted = excluded.deleted,
                data = excluded.data
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.txn_id.to_string())
        .bind(log.channel_id.to_string())
        .bind(log.deleted)
        .bind(encode(log)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn write_representation_log(
        tx: &mut Transaction<'_, Sqlite>,
        log: &RepresentationLogEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO representation_logs (id, replication_log_id, deleted, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                deleted = excluded.deleted,
                data = excluded.data
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.replication_log_id.to_string())
        .bind(log.deleted)
        .bind(encode(log)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn write_operation(
        tx: &mut Transaction<'_, Sqlite>,
        op: &DurableOperation,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_operations (id, channel_id, status, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                data = excluded.data
            "#,
        )
        .bind(op.id.to_string())
        .bind(op.channel_id.to_string())
        .bind(op.status.as_str())
        .bind(encode(op)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn write_checkpoint(
        tx: &mut Transaction<'_, Sqlite>,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (queue, device_id, cursor, date_modified)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(queue, device_id) DO UPDATE SET
                cursor = excluded.cursor,
                date_modified = excluded.date_modified
            "#,
        )
        .bind(&checkpoint.queue)
        .bind(checkpoint.device_id.to_string())
        .bind(&checkpoint.cursor)
        .bind(checkpoint.date_modified.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn fetch_entities(&self, kind: EntityKind, parent_id: Option<Uuid>) -> Result<Vec<Entity>, StoreError> {
        let rows: Vec<DataRow> = match parent_id {
            Some(parent_id) => {
                sqlx::query_as(
                    "SELECT data FROM entities WHERE kind = ? AND parent_id = ? AND deleted = 0 ORDER BY name, id",
                )
                .bind(kind.model_name())
                .bind(parent_id.to_string())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as("SELECT data FROM entities WHERE kind = ? AND deleted = 0 ORDER BY name, id")
                    .bind(kind.model_name())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_error)?;

        rows.iter().map(|row| decode(&row.data)).collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for entity in &changes.entities {
            Self::write_entity(&mut tx, entity).await?;
        }
        for channel in &changes.channels {
            Self::write_channel(&mut tx, channel).await?;
        }
        for (target, patch) in &changes.metadata_patches {
            Self::apply_patch(&mut tx, target, patch).await?;
        }
        for creds in &changes.credentials {
            Self::write_credentials(&mut tx, creds).await?;
        }
        for log in &changes.replication_logs {
            Self::write_replication_log(&mut tx, log).await?;
        }
        for log in &changes.representation_logs {
            Self::write_representation_log(&mut tx, log).await?;
        }
        for op in &changes.operations {
            Self::write_operation(&mut tx, op).await?;
        }
        for checkpoint in &changes.checkpoints {
            Self::write_checkpoint(&mut tx, checkpoint).await?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn entity(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        let row: Option<DataRow> = sqlx::query_as("SELECT data FROM entities WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(|row| decode(&row.data)).transpose()
    }

    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        self.fetch_entities(kind, None).await
    }

    async fn children(&self, parent_id: Uuid, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        self.fetch_entities(kind, Some(parent_id)).await
    }

    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError> {
        let row: Option<DataRow> = sqlx::query_as("SELECT data FROM channels WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(|row| decode(&row.data)).transpose()
    }

    async fn channels(&self, database_id: Uuid) -> Result<Vec<Channel>, StoreError> {
        let rows: Vec<DataRow> = sqlx::query_as(
            "SELECT data FROM channels WHERE database_id = ? ORDER BY origin DESC, name",
        )
        .bind(database_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(|row| decode(&row.data)).collect()
    }

    async fn device_credentials(
        &self,
        device_id: Uuid,
        endpoint: &str,
    ) -> Result<Option<DeviceCredentials>, StoreError> {
        let row: Option<CredentialsRow> = sqlx::query_as(
            "SELECT * FROM device_credentials WHERE device_id = ? AND endpoint = ?",
        )
        .bind(device_id.to_string())
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(DeviceCredentials {
                device_id: parse_uuid(&row.device_id)?,
                endpoint: row.endpoint,
                account_id: row.account_id,
                access_token: row.access_token,
                password: row.password,
            })
        })
        .transpose()
    }

    async fn pending_replication_logs(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<ReplicationLogEntry>, StoreError> {
        let rows: Vec<SeqRow> = sqlx::query_as(
            "SELECT seq, data FROM replication_logs WHERE channel_id = ? AND deleted = 0 ORDER BY seq",
        )
        .bind(channel_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let mut log: ReplicationLogEntry = decode(&row.data)?;
                log.seq = row.seq;
                Ok(log)
            })
            .collect()
    }

    async fn pending_representation_logs(
        &self,
        replication_log_id: Uuid,
    ) -> Result<Vec<RepresentationLogEntry>, StoreError> {
        let rows: Vec<SeqRow> = sqlx::query_as(
            "SELECT seq, data FROM representation_logs WHERE replication_log_id = ? AND deleted = 0 ORDER BY seq",
        )
        .bind(replication_log_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let mut log: RepresentationLogEntry = decode(&row.data)?;
                log.seq = row.seq;
                Ok(log)
            })
            .collect()
    }

    async fn pending_operations(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<DurableOperation>, StoreError> {
        let rows: Vec<SeqRow> = sqlx::query_as(
            "SELECT seq, data FROM durable_operations WHERE channel_id = ? AND status = ? ORDER BY seq",
        )
        .bind(channel_id.to_string())
        .bind(OperationStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let mut op: DurableOperation = decode(&row.data)?;
                op.seq = row.seq;
                Ok(op)
            })
            .collect()
    }

    async fn operation(&self, id: Uuid) -> Result<Option<DurableOperation>, StoreError> {
        let row: Option<SeqRow> =
            sqlx::query_as("SELECT seq, data FROM durable_operations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|row| {
            let mut op: DurableOperation = decode(&row.data)?;
            op.seq = row.seq;
            Ok(op)
        })
        .transpose()
    }

    async fn checkpoint(
        &self,
        queue: &str,
        device_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row: Option<CheckpointRow> =
            sqlx::query_as("SELECT * FROM checkpoints WHERE queue = ? AND device_id = ?")
                .bind(queue)
                .bind(device_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|row| {
            let date_modified = chrono::DateTime::parse_from_rfc3339(&row.date_modified)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(Checkpoint {
                queue: row.queue,
                device_id: parse_uuid(&row.device_id)?,
                cursor: row.cursor,
                date_modified,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use fractal_core::models::metadata::ROOM_ID;
    use fractal_core::models::OperationKind;
    use fractal_core::{add_channel, save_entity};
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("fractal.db")).await.unwrap();
        (temp_dir, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn test_entity_roundtrip_and_children() {
        let (_dir, store) = store().await;
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();
        let app = save_entity(&store, Entity::app("Photos", &db)).await.unwrap();

        let loaded = store.entity(app.id).await.unwrap().unwrap();
        assert_eq!(loaded, app);
        assert_eq!(store.children(db.id, EntityKind::App).await.unwrap(), vec![app]);
        assert!(store.children(db.id, EntityKind::Service).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_channel_commits_everything_together() {
        let (_dir, store) = store().await;
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();

        let added = add_channel(&store, Channel::new(db.id, "https://matrix.example"))
            .await
            .unwrap();

        let channels = store.channels(db.id).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert!(channels[0].origin);
        let pending = store.pending_operations(added.channel.id).await.unwrap();
        assert_eq!(pending.len(), added.operations.len());
        assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(pending[0].kind, OperationKind::CreateSpace);
        assert_eq!(
            store.pending_replication_logs(added.channel.id).await.unwrap().len(),
            added.snapshot_len
        );
    }

    #[tokio::test]
    async fn test_upsert_keeps_creation_order() {
        let (_dir, store) = store().await;
        let channel_id = Uuid::new_v4();
        let target = InstanceRef::new(InstanceKind::Channel, channel_id);
        let first = DurableOperation::new(OperationKind::CreateSpace, target, channel_id, Metadata::new());
        let second = DurableOperation::new(OperationKind::CreateAppsSubspace, target, channel_id, Metadata::new());
        store
            .commit(ChangeSet {
                operations: vec![first.clone(), second.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut failed = first.clone();
        failed.status = OperationStatus::Failed;
        failed.attempts = 3;
        store
            .commit(ChangeSet {
                operations: vec![failed],
                ..Default::default()
            })
            .await
            .unwrap();

        let pending = store.pending_operations(channel_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        let stored = store.operation(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert!(stored.seq < pending[0].seq);
    }

    #[tokio::test]
    async fn test_credentials_and_checkpoints() {
        let (_dir, store) = store().await;
        let device_id = Uuid::new_v4();
        store
            .commit(ChangeSet {
                credentials: vec![DeviceCredentials {
                    device_id,
                    endpoint: "https://matrix.example".into(),
                    account_id: "@laptop:matrix.example".into(),
                    access_token: "token".into(),
                    password: "secret".into(),
                }],
                checkpoints: vec![Checkpoint::new("replication:!q:matrix.example", device_id, Some("s1|0".into()))],
                ..Default::default()
            })
            .await
            .unwrap();

        let creds = store
            .device_credentials(device_id, "https://matrix.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creds.account_id, "@laptop:matrix.example");
        assert!(store
            .device_credentials(device_id, "https://other.example")
            .await
            .unwrap()
            .is_none());

        let checkpoint = store
            .checkpoint("replication:!q:matrix.example", device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.cursor.as_deref(), Some("s1|0"));
    }

    #[tokio::test]
    async fn test_stale_upsert_and_patch_keep_newer_row() {
        let (_dir, store) = store().await;
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();
        let mut newer = db.clone();
        newer.name = "Renamed".into();
        newer.object_version = db.object_version + 4;
        store
            .commit(ChangeSet {
                entities: vec![newer.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut changes = ChangeSet {
            entities: vec![db.clone()],
            ..Default::default()
        };
        changes.patch_metadata(
            InstanceRef::new(InstanceKind::Database, db.id),
            Metadata::new().with(ROOM_ID, "!root:matrix.example"),
        );
        store.commit(changes).await.unwrap();

        let stored = store.entity(db.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.object_version, newer.object_version);
        assert_eq!(stored.room_id(), Some("!root:matrix.example"));
    }

    #[tokio::test]
    async fn test_patch_for_missing_row_rolls_back() {
        let (_dir, store) = store().await;
        let db = Entity::database("Home");
        let mut changes = ChangeSet {
            entities: vec![db.clone()],
            ..Default::default()
        };
        changes.patch_metadata(
            InstanceRef::new(InstanceKind::Channel, Uuid::new_v4()),
            Metadata::new().with(ROOM_ID, "!x:matrix.example"),
        );

        let result = store.commit(changes).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(store.entity(db.id).await.unwrap().is_none());
    }
}
