use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{Channel, Entity, EntityKind, FixtureEntry, CHANNEL_MODEL};
use crate::store::{ChangeSet, Store};

use super::prune;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Applies a received fixture. A record is written only when its incoming
/// `object_version` is newer than the local copy, so applying the same
/// fixture again changes nothing. Room ids known only locally are kept.
pub async fn apply_fixture(store: &dyn Store, entries: &[FixtureEntry]) -> Result<ApplyReport> {
    let mut changes = ChangeSet::new();
    let mut report = ApplyReport::default();

    for entry in prune(entries.to_vec()) {
        if entry.model == CHANNEL_MODEL {
            let mut incoming = Channel::from_fixture(&entry)?;
            if let Some(local) = store.channel(incoming.id).await? {
                if incoming.object_version <= local.object_version {
                    report.skipped += 1;
                    continue;
                }
                incoming.metadata.merge(&local.metadata);
            }
            changes.channels.push(incoming);
            report.applied += 1;
        } else if let Some(kind) = EntityKind::from_model_name(&entry.model) {
            let mut incoming = Entity::from_fixture(&entry)?;
            if incoming.kind != kind {
                warn!(model = %entry.model, pk = %entry.pk, "Fixture kind does not match model");
                report.skipped += 1;
                continue;
            }
            if let Some(local) = store.entity(incoming.id).await? {
                if incoming.object_version <= local.object_version {
                    report.skipped += 1;
                    continue;
                }
                incoming.metadata.merge(&local.metadata);
            }
            changes.entities.push(incoming);
            report.applied += 1;
        } else {
            warn!(model = %entry.model, pk = %entry.pk, "Skipping unknown model");
            report.skipped += 1;
        }
    }

    if !changes.is_empty() {
        store.commit(changes).await?;
    }
    debug!(applied = report.applied, skipped = report.skipped, "Applied fixture");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::ROOM_ID;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_apply_twice_is_a_no_op() {
        let store = MemoryStore::new();
        let mut db = Entity::database("Home");
        db.touch();
        let channel = Channel::new(db.id, "http://a").with_origin(true);
        let fixture = vec![db.to_fixture().unwrap(), channel.to_fixture().unwrap()];

        let first = apply_fixture(&store, &fixture).await.unwrap();
        let after_first = store.entity(db.id).await.unwrap();
        let second = apply_fixture(&store, &fixture).await.unwrap();

        assert_eq!(first, ApplyReport { applied: 2, skipped: 0 });
        assert_eq!(second, ApplyReport { applied: 0, skipped: 2 });
        assert_eq!(store.entity(db.id).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_older_version_never_overwrites() {
        let store = MemoryStore::new();
        let mut db = Entity::database("Home");
        db.touch();
        let old = db.to_fixture().unwrap();
        db.name = "Renamed".into();
        db.touch();
        let new = db.to_fixture().unwrap();

        apply_fixture(&store, &[new]).await.unwrap();
        apply_fixture(&store, &[old]).await.unwrap();

        let stored = store.entity(db.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.object_version, 2);
    }

    #[tokio::test]
    async fn test_local_room_ids_survive_newer_fixture() {
        let store = MemoryStore::new();
        let mut db = Entity::database("Home");
        db.touch();
        let mut local = db.clone();
        local.metadata.insert(ROOM_ID, "!root:localhost");
        store
            .commit(ChangeSet {
                entities: vec![local],
                ..Default::default()
            })
            .await
            .unwrap();

        db.touch();
        apply_fixture(&store, &[db.to_fixture().unwrap()]).await.unwrap();

        let stored = store.entity(db.id).await.unwrap().unwrap();
        assert_eq!(stored.object_version, 2);
        assert_eq!(stored.room_id(), Some("!root:localhost"));
    }

    #[tokio::test]
    async fn test_unknown_models_are_skipped() {
        let store = MemoryStore::new();
        let entry = FixtureEntry::new("fractal.widget", "w1", Default::default());
        let report = apply_fixture(&store, &[entry]).await.unwrap();
        assert_eq!(report, ApplyReport { applied: 0, skipped: 1 });
    }
}
