//! Local mutations. Each one writes the entity change together with the
//! replication logs, representation steps and durable operations it implies,
//! in a single change set.

use tracing::info;
use uuid::Uuid;

use crate::error::{ReplicationError, Result};
use crate::models::{
    Channel, DurableOperation, Entity, EntityKind, InstanceKind, InstanceRef, ReplicationLogEntry,
    RepresentationLogEntry,
};
use crate::operations::{load_members, plan_database, plan_first_appearance, plan_nested_database};
use crate::store::{ChangeSet, Store};

/// Databases an entity replicates into.
async fn owning_databases(store: &dyn Store, entity: &Entity) -> Result<Vec<Uuid>> {
    match entity.kind {
        EntityKind::Database => Ok(vec![entity.id]),
        EntityKind::App | EntityKind::Service | EntityKind::DeviceMembership => {
            Ok(entity.parent_id.into_iter().collect())
        }
        EntityKind::Device => Ok(store
            .entities(EntityKind::DeviceMembership)
            .await?
            .into_iter()
            .filter(|m| m.device_id == Some(entity.id))
            .filter_map(|m| m.parent_id)
            .collect()),
    }
}

/// Saves a local change to `entity`.
///
/// Bumps the version past any stored copy, queues one replication log per
/// active target channel, and on the entity's first appearance queues the
/// representation steps that realize it on each channel.
pub async fn save_entity(store: &dyn Store, mut entity: Entity) -> Result<Entity> {
    let previous = store.entity(entity.id).await?;
    if let Some(previous) = &previous {
        entity.object_version = entity.object_version.max(previous.object_version);
        entity.metadata.merge(&previous.metadata);
    }
    entity.touch();

    let txn_id = Uuid::new_v4();
    let reference = InstanceRef::new(entity.kind.into(), entity.id);
    let payload = entity.to_fixture()?;
    let mut changes = ChangeSet::new();

    for database_id in owning_databases(store, &entity).await? {
        for channel in store.channels(database_id).await? {
            if !channel.is_active_target() {
                continue;
            }
            let log = ReplicationLogEntry::new(txn_id, channel.id, reference, payload.clone());
            if previous.is_none() {
                let steps = plan_first_appearance(store, &entity, &channel).await?;
                changes.representation_logs.extend(
                    steps
                        .into_iter()
                        .map(|op| RepresentationLogEntry::from_operation(&log, op)),
                );
            }
            changes.replication_logs.push(log);
        }
    }

    info!(
        entity = %entity,
        version = entity.object_version,
        logs = changes.replication_logs.len(),
        "Saved entity"
    );
    changes.entities.push(entity.clone());
    store.commit(changes).await?;
    Ok(entity)
}

/// Result of [`add_channel`].
#[derive(Debug, Clone)]
pub struct ChannelAdded {
    pub channel: Channel,
    pub operations: Vec<DurableOperation>,
    /// Snapshot entries queued so the new destination receives existing data.
    pub snapshot_len: usize,
}

/// Binds a database to a new destination.
///
/// The first channel of a database becomes its origin; a second origin is a
/// configuration error. Plans the structure of the database and its apps and
/// services on the channel, and queues a snapshot of everything the database
/// holds.
pub async fn add_channel(store: &dyn Store, mut channel: Channel) -> Result<ChannelAdded> {
    let database = store
        .entity(channel.database_id)
        .await?
        .filter(|db| db.kind == EntityKind::Database)
        .ok_or_else(|| {
            ReplicationError::config(format!("no root database {}", channel.database_id))
        })?;

    let existing = store.channels(database.id).await?;
    let has_origin = existing.iter().any(|c| c.origin && !c.deleted && c.id != channel.id);
    if channel.origin && has_origin {
        return Err(ReplicationError::config(format!(
            "{} already has an origin channel",
            database
        )));
    }
    if !has_origin {
        channel.origin = true;
    }
    channel.touch();

    let members = load_members(store, database.id).await?;
    let mut operations = plan_database(&database, &channel, &members)?;
    let mut nested = store.children(database.id, EntityKind::App).await?;
    nested.extend(store.children(database.id, EntityKind::Service).await?);
    for entity in &nested {
        operations.extend(plan_nested_database(entity, &channel)?);
    }

    let txn_id = Uuid::new_v4();
    let mut snapshot = vec![(
        InstanceRef::new(InstanceKind::Database, database.id),
        database.to_fixture()?,
    )];
    snapshot.push((
        InstanceRef::new(InstanceKind::Channel, channel.id),
        channel.to_fixture()?,
    ));
    for member in &members {
        snapshot.push((
            InstanceRef::new(InstanceKind::Device, member.device.id),
            member.device.to_fixture()?,
        ));
        snapshot.push((
            InstanceRef::new(InstanceKind::DeviceMembership, member.membership.id),
            member.membership.to_fixture()?,
        ));
    }
    for entity in &nested {
        snapshot.push((InstanceRef::new(entity.kind.into(), entity.id), entity.to_fixture()?));
    }
    let replication_logs: Vec<_> = snapshot
        .into_iter()
        .map(|(reference, payload)| ReplicationLogEntry::new(txn_id, channel.id, reference, payload))
        .collect();
    let snapshot_len = replication_logs.len();

    info!(
        channel = %channel,
        origin = channel.origin,
        operations = operations.len(),
        snapshot = snapshot_len,
        "Added channel"
    );
    store
        .commit(ChangeSet {
            channels: vec![channel.clone()],
            operations: operations.clone(),
            replication_logs,
            ..Default::default()
        })
        .await?;

    Ok(ChannelAdded {
        channel,
        operations,
        snapshot_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationKind;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_save_bumps_version_monotonically() {
        let store = MemoryStore::new();
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();
        assert_eq!(db.object_version, 1);

        let mut stale = db.clone();
        stale.object_version = 0;
        let db = save_entity(&store, stale).await.unwrap();
        assert_eq!(db.object_version, 2);
    }

    #[tokio::test]
    async fn test_first_channel_becomes_origin() {
        let store = MemoryStore::new();
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();

        let added = add_channel(&store, Channel::new(db.id, "http://a")).await.unwrap();
        assert!(added.channel.origin);

        let second = add_channel(&store, Channel::new(db.id, "http://b")).await.unwrap();
        assert!(!second.channel.origin);

        let again = add_channel(&store, Channel::new(db.id, "http://c").with_origin(true)).await;
        assert!(matches!(again, Err(ReplicationError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_new_app_queues_log_and_representation_steps() {
        let store = MemoryStore::new();
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();
        let origin = add_channel(&store, Channel::new(db.id, "http://a")).await.unwrap().channel;

        let app = save_entity(&store, Entity::app("Photos", &db)).await.unwrap();

        let logs = store.pending_replication_logs(origin.id).await.unwrap();
        let app_log = logs
            .iter()
            .find(|log| log.instance.id == app.id)
            .expect("app log");
        let steps = store.pending_representation_logs(app_log.id).await.unwrap();
        let kinds: Vec<_> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![OperationKind::CreateSpace, OperationKind::CreateSubspace]);

        // A later change replicates but plans nothing new.
        save_entity(&store, app.clone()).await.unwrap();
        let logs = store.pending_replication_logs(origin.id).await.unwrap();
        let latest = logs.iter().filter(|log| log.instance.id == app.id).last().unwrap();
        assert!(store.pending_representation_logs(latest.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_channel_snapshots_existing_entities() {
        let store = MemoryStore::new();
        let db = save_entity(&store, Entity::database("Home")).await.unwrap();
        let device = save_entity(&store, Entity::device("Laptop")).await.unwrap();
        save_entity(&store, Entity::membership(&device, &db)).await.unwrap();
        save_entity(&store, Entity::service("Sync", &db)).await.unwrap();

        let added = add_channel(&store, Channel::new(db.id, "http://a")).await.unwrap();

        // database, channel, device, membership, service
        assert_eq!(added.snapshot_len, 5);
        let logs = store.pending_replication_logs(added.channel.id).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert!(logs.iter().all(|log| log.txn_id == logs[0].txn_id));
        assert!(added
            .operations
            .iter()
            .any(|op| op.kind == OperationKind::CreateSubspace));
    }
}
