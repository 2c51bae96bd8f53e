use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fractal_core::consumer::{Broker, QueueBinding, QueueKind, Worker};
use fractal_core::models::metadata::{APPS_ROOM_ID, DEVICES_ROOM_ID, SERVICES_ROOM_ID};
use fractal_core::operations::{load_members, plan_database, Executor};
use fractal_core::transport::CreateRoomRequest;
use fractal_core::{
    add_channel, prune, save_entity, Channel, ChangeSet, Checkpoint, Credentials, DeviceCredentials,
    DurableOperation, Entity, EntityKind, FixtureEntry, MemoryStore, MemoryTransport,
    OperationKind, OperationStatus, Pipeline, ReplicationContext, ReplicationError,
    ReplicationLogEntry, RepresentationLogEntry, RetryPolicy, Store, StoreError, Task,
    TaskDispatcher, Transport,
};
use serde_json::{json, Map};
use uuid::Uuid;

const ORIGIN: &str = "http://a.example";
const MIRROR: &str = "http://b.example";

struct Home {
    transport: Arc<MemoryTransport>,
    store: Arc<MemoryStore>,
    alice_a: Credentials,
    alice_b: Credentials,
    db: Entity,
    device: Entity,
    membership: Entity,
    app: Entity,
    origin: Channel,
    mirror: Channel,
}

impl Home {
    fn executor(&self) -> Executor {
        let ctx = ReplicationContext::new(self.device.id, self.db.id)
            .with_session(self.alice_a.clone())
            .with_session(self.alice_b.clone());
        Executor::new(self.store.clone(), self.transport.clone(), ctx)
            .with_retry(RetryPolicy::immediate(1))
    }

    fn pipeline(&self) -> Pipeline {
        let dispatcher = TaskDispatcher::new(self.transport.clone(), RetryPolicy::immediate(1));
        Pipeline::new(self.executor(), dispatcher)
    }

    async fn channel(&self, id: Uuid) -> Channel {
        self.store.channel(id).await.unwrap().unwrap()
    }

    async fn entity(&self, id: Uuid) -> Entity {
        self.store.entity(id).await.unwrap().unwrap()
    }
}

/// Database "Home" with device "Laptop" and app "Photos", bound to an origin
/// and a mirror endpoint.
async fn home() -> Home {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryStore::new());
    let alice_a = transport.login(ORIGIN, "alice").await;
    let alice_b = transport.login(MIRROR, "alice").await;

    let db = save_entity(store.as_ref(), Entity::database("Home")).await.unwrap();
    let device = save_entity(
        store.as_ref(),
        Entity::device("Laptop").with_owner(alice_a.identity.clone()),
    )
    .await
    .unwrap();
    let membership = save_entity(store.as_ref(), Entity::membership(&device, &db))
        .await
        .unwrap();
    let app = save_entity(store.as_ref(), Entity::app("Photos", &db)).await.unwrap();

    let origin = add_channel(store.as_ref(), Channel::new(db.id, ORIGIN))
        .await
        .unwrap()
        .channel;
    let mirror = add_channel(store.as_ref(), Channel::new(db.id, MIRROR))
        .await
        .unwrap()
        .channel;

    Home {
        transport,
        store,
        alice_a,
        alice_b,
        db,
        device,
        membership,
        app,
        origin,
        mirror,
    }
}

fn entry(pk: &str, version: u64) -> FixtureEntry {
    let mut fields = Map::new();
    fields.insert("object_version".into(), json!(version));
    fields.insert("name".into(), json!(format!("{}-v{}", pk, version)));
    FixtureEntry::new("fractal.device", pk, fields)
}

#[tokio::test]
async fn test_hierarchy_is_realized_on_both_endpoints() {
    let home = home().await;
    let executor = home.executor();

    let first = executor.run_pending(home.origin.id).await.unwrap();
    let second = executor.run_pending(home.mirror.id).await.unwrap();
    assert_eq!(first.failed, 0);
    assert_eq!(second.failed, 0);

    let origin = home.channel(home.origin.id).await;
    let root = origin.room_id().unwrap().to_string();
    let devices = origin.metadata.get_str(DEVICES_ROOM_ID).unwrap().to_string();
    let apps = origin.metadata.get_str(APPS_ROOM_ID).unwrap().to_string();
    let services = origin.metadata.get_str(SERVICES_ROOM_ID).unwrap().to_string();

    // The origin root doubles as the database's own space.
    let db = home.entity(home.db.id).await;
    assert_eq!(db.room_id(), Some(root.as_str()));
    assert!(home.transport.is_space(&root).await);
    assert_eq!(home.transport.room_name(&root).await.as_deref(), Some("Home"));

    let mut expected = vec![devices.clone(), apps.clone(), services.clone()];
    expected.sort();
    assert_eq!(home.transport.children(&root).await, expected);

    let app = home.entity(home.app.id).await;
    let app_room = app.room_id().unwrap().to_string();
    assert_eq!(home.transport.children(&apps).await, vec![app_room.clone()]);

    // The device has its own account and room on each endpoint.
    let creds = home
        .store
        .device_credentials(home.device.id, ORIGIN)
        .await
        .unwrap()
        .unwrap();
    assert!(home
        .store
        .device_credentials(home.device.id, MIRROR)
        .await
        .unwrap()
        .is_some());
    let membership = home.entity(home.membership.id).await;
    let device_room = membership
        .metadata
        .get_str(&home.origin.id.to_string())
        .unwrap()
        .to_string();
    assert_eq!(home.transport.children(&devices).await, vec![device_room.clone()]);
    assert!(home.transport.members(&device_room).await.contains(&creds.account_id));
    assert!(home.transport.members(&services).await.contains(&creds.account_id));
    assert_eq!(
        home.transport.display_name(&creds.account_id).await.as_deref(),
        Some("alice's Laptop")
    );

    // The mirror links the existing database and app spaces, it does not
    // create new ones.
    let mirror = home.channel(home.mirror.id).await;
    let mirror_root = mirror.room_id().unwrap();
    assert_ne!(mirror_root, root);
    assert!(home.transport.children(mirror_root).await.contains(&root));
    let mirror_apps = mirror.metadata.get_str(APPS_ROOM_ID).unwrap();
    assert_eq!(home.transport.children(mirror_apps).await, vec![app_room]);

    assert!(home.store.pending_operations(home.origin.id).await.unwrap().is_empty());
    assert!(home.store.pending_operations(home.mirror.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_running_pending_twice_creates_nothing_new() {
    let home = home().await;
    let executor = home.executor();
    executor.run_pending(home.origin.id).await.unwrap();
    let rooms = home.transport.room_count().await;

    let ops = plan_database(&home.entity(home.db.id).await, &home.channel(home.origin.id).await, &[])
        .unwrap();
    home.store
        .commit(ChangeSet {
            operations: ops,
            ..Default::default()
        })
        .await
        .unwrap();
    let summary = executor.run_pending(home.origin.id).await.unwrap();

    assert_eq!(summary.failed, 0);
    assert_eq!(home.transport.room_count().await, rooms);
}

#[tokio::test]
async fn test_only_non_origin_channels_link_the_existing_space() {
    let home = home().await;
    let count = |channel: &Channel| {
        plan_database(&home.db, channel, &[])
            .unwrap()
            .iter()
            .filter(|op| op.kind == OperationKind::AddExistingSubspace)
            .count()
    };
    assert_eq!(count(&home.origin), 0);
    assert_eq!(count(&home.mirror), 1);

    // Linking the origin space under its own root is refused.
    let executor = home.executor();
    executor.run_pending(home.origin.id).await.unwrap();
    let origin = home.channel(home.origin.id).await;
    let db = home.entity(home.db.id).await;
    let mut forced = origin.clone();
    forced.origin = false;
    let link = plan_database(&db, &forced, &[])
        .unwrap()
        .into_iter()
        .find(|op| op.kind == OperationKind::AddExistingSubspace)
        .unwrap();
    let result = executor.run_operation(&link).await;
    assert!(matches!(result, Err(ReplicationError::Configuration(_))));
}

#[tokio::test]
async fn test_concurrent_origin_creation_yields_one_space() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = transport.login(ORIGIN, "alice").await;
    let mut db = Entity::database("Home");
    db.touch();
    let channel = Channel::new(db.id, ORIGIN).with_origin(true);
    let create = plan_database(&db, &channel, &[]).unwrap().remove(0);
    assert_eq!(create.kind, OperationKind::CreateSpace);

    let mut executors = Vec::new();
    let mut stores = Vec::new();
    for _ in 0..2 {
        let store = Arc::new(MemoryStore::new());
        store
            .commit(ChangeSet {
                entities: vec![db.clone()],
                channels: vec![channel.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        let session = transport.login(ORIGIN, "alice").await;
        let ctx = ReplicationContext::new(Uuid::new_v4(), db.id).with_session(session);
        executors.push(Executor::new(store.clone(), transport.clone(), ctx));
        stores.push(store);
    }

    let (a, b) = tokio::join!(
        executors[0].run_operation(&create),
        executors[1].run_operation(&create)
    );
    a.unwrap();
    b.unwrap();

    let first = stores[0].channel(channel.id).await.unwrap().unwrap();
    let second = stores[1].channel(channel.id).await.unwrap().unwrap();
    assert_eq!(first.room_id(), second.room_id());
    assert_eq!(transport.room_count().await, 1);
    assert!(transport.members(first.room_id().unwrap()).await.contains(&alice.identity));
}

#[tokio::test]
async fn test_second_device_replays_queue_and_resumes_from_checkpoint() {
    let home = home().await;
    let pipeline = home.pipeline();
    pipeline.executor().run_pending(home.origin.id).await.unwrap();

    let report = pipeline.replicate(home.origin.id).await.unwrap();
    // database, channel, device, membership, app
    assert_eq!(report.batches, 1);
    assert_eq!(report.entries, 5);
    assert!(home
        .store
        .pending_replication_logs(home.origin.id)
        .await
        .unwrap()
        .is_empty());

    let room_id = home.channel(home.origin.id).await.room_id().unwrap().to_string();
    let phone_store = Arc::new(MemoryStore::new());
    let phone_id = Uuid::new_v4();
    let worker = |store: Arc<MemoryStore>| {
        let ctx = ReplicationContext::new(phone_id, home.db.id).with_session(home.alice_a.clone());
        let executor = Executor::new(store.clone(), home.transport.clone(), ctx);
        let dispatcher = TaskDispatcher::new(home.transport.clone(), RetryPolicy::immediate(1));
        let broker = Broker::new(
            home.transport.clone(),
            store,
            home.alice_a.clone(),
            phone_id,
            vec![QueueBinding::new(QueueKind::Replication, room_id.clone())],
        )
        .with_fetch_timeout(Duration::from_millis(50));
        Worker::new(broker, Pipeline::new(executor, dispatcher)).with_retry(RetryPolicy::immediate(1))
    };

    // A device with no checkpoint reads the whole queue.
    let mut phone = worker(phone_store.clone());
    assert_eq!(phone.run_once().await.unwrap(), 1);
    for id in [home.db.id, home.device.id, home.membership.id, home.app.id] {
        assert!(phone_store.entity(id).await.unwrap().is_some());
    }
    assert!(phone_store.channel(home.origin.id).await.unwrap().is_some());

    let mut renamed = home.entity(home.app.id).await;
    renamed.name = "Albums".into();
    save_entity(home.store.as_ref(), renamed).await.unwrap();
    let report = pipeline.replicate(home.origin.id).await.unwrap();
    assert_eq!(report.entries, 1);

    // A restarted worker resumes after the acknowledged snapshot.
    let mut restarted = worker(phone_store.clone());
    assert_eq!(restarted.run_once().await.unwrap(), 1);
    let app = phone_store.entity(home.app.id).await.unwrap().unwrap();
    assert_eq!(app.name, "Albums");
}

#[tokio::test]
async fn test_unreachable_channel_gives_up_after_bounded_retries() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let db = save_entity(store.as_ref(), Entity::database("Home")).await.unwrap();
    let channel = add_channel(store.as_ref(), Channel::new(db.id, ORIGIN))
        .await
        .unwrap()
        .channel;

    // The session is known but the endpoint rejects it: nothing can be
    // realized.
    let revoked = Credentials::new("revoked-token", ORIGIN, "@alice:a.example");
    let ctx = ReplicationContext::new(Uuid::new_v4(), db.id).with_session(revoked);
    let executor = Executor::new(store.clone(), transport.clone(), ctx)
        .with_retry(RetryPolicy::immediate(1));
    let pipeline = Pipeline::new(executor, TaskDispatcher::new(transport, RetryPolicy::immediate(1)));

    let result = pipeline.replicate(channel.id).await;
    assert!(matches!(
        result,
        Err(ReplicationError::RetriesExhausted { attempts: 2, .. })
    ));
    assert!(!store.pending_replication_logs(channel.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_session_is_reported_before_bootstrap() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let db = save_entity(store.as_ref(), Entity::database("Home")).await.unwrap();
    let added = add_channel(store.as_ref(), Channel::new(db.id, ORIGIN)).await.unwrap();
    let channel = added.channel;

    let ctx = ReplicationContext::new(Uuid::new_v4(), db.id);
    let executor = Executor::new(store.clone(), transport.clone(), ctx)
        .with_retry(RetryPolicy::immediate(1));
    let pipeline = Pipeline::new(executor, TaskDispatcher::new(transport, RetryPolicy::immediate(1)));

    let result = pipeline.replicate(channel.id).await;
    assert!(matches!(result, Err(ReplicationError::AuthenticationRequired(_))));

    // Nothing was run, so nothing was marked failed.
    let pending = store.pending_operations(channel.id).await.unwrap();
    assert_eq!(pending.len(), added.operations.len());
    for op in &added.operations {
        let stored = store.operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
    }
    assert!(!store.pending_replication_logs(channel.id).await.unwrap().is_empty());
}

/// Commits a renamed, newer copy of one database every time it is read,
/// standing in for a fixture applied while an operation is in flight.
struct RenamingStore {
    inner: Arc<MemoryStore>,
    database_id: Uuid,
    latest: AtomicU64,
}

#[async_trait]
impl Store for RenamingStore {
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        self.inner.commit(changes).await
    }

    async fn entity(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        let found = self.inner.entity(id).await?;
        if let Some(db) = found.as_ref().filter(|_| id == self.database_id) {
            let mut renamed = db.clone();
            renamed.name = "Renamed".into();
            renamed.touch();
            self.latest.store(renamed.object_version, Ordering::SeqCst);
            self.inner
                .commit(ChangeSet {
                    entities: vec![renamed],
                    ..Default::default()
                })
                .await?;
        }
        Ok(found)
    }

    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        self.inner.entities(kind).await
    }

    async fn children(&self, parent_id: Uuid, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        self.inner.children(parent_id, kind).await
    }

    async fn channel(&self, id: Uuid) -> Result<Option<Channel>, StoreError> {
        self.inner.channel(id).await
    }

    async fn channels(&self, database_id: Uuid) -> Result<Vec<Channel>, StoreError> {
        self.inner.channels(database_id).await
    }

    async fn device_credentials(
        &self,
        device_id: Uuid,
        endpoint: &str,
    ) -> Result<Option<DeviceCredentials>, StoreError> {
        self.inner.device_credentials(device_id, endpoint).await
    }

    async fn pending_replication_logs(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<ReplicationLogEntry>, StoreError> {
        self.inner.pending_replication_logs(channel_id).await
    }

    async fn pending_representation_logs(
        &self,
        replication_log_id: Uuid,
    ) -> Result<Vec<RepresentationLogEntry>, StoreError> {
        self.inner.pending_representation_logs(replication_log_id).await
    }

    async fn pending_operations(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<DurableOperation>, StoreError> {
        self.inner.pending_operations(channel_id).await
    }

    async fn operation(&self, id: Uuid) -> Result<Option<DurableOperation>, StoreError> {
        self.inner.operation(id).await
    }

    async fn checkpoint(
        &self,
        queue: &str,
        device_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.checkpoint(queue, device_id).await
    }
}

#[tokio::test]
async fn test_operation_results_keep_concurrent_edits() {
    let transport = Arc::new(MemoryTransport::new());
    let inner = Arc::new(MemoryStore::new());
    let alice = transport.login(ORIGIN, "alice").await;
    let db = save_entity(inner.as_ref(), Entity::database("Home")).await.unwrap();
    let origin = add_channel(inner.as_ref(), Channel::new(db.id, ORIGIN))
        .await
        .unwrap()
        .channel;

    let store = Arc::new(RenamingStore {
        inner: inner.clone(),
        database_id: db.id,
        latest: AtomicU64::new(db.object_version),
    });
    let ctx = ReplicationContext::new(Uuid::new_v4(), db.id).with_session(alice);
    let executor = Executor::new(store.clone(), transport.clone(), ctx)
        .with_retry(RetryPolicy::immediate(1));

    let summary = executor.run_pending(origin.id).await.unwrap();
    assert_eq!(summary.failed, 0);

    let stored = inner.entity(db.id).await.unwrap().unwrap();
    assert!(stored.object_version > db.object_version);
    assert_eq!(stored.object_version, store.latest.load(Ordering::SeqCst));
    assert_eq!(stored.name, "Renamed");
    let origin = inner.channel(origin.id).await.unwrap().unwrap();
    assert!(stored.room_id().is_some());
    assert_eq!(stored.room_id(), origin.room_id());
}

#[tokio::test]
async fn test_registered_device_is_not_registered_again() {
    let home = home().await;
    let executor = home.executor();
    let first = executor.run_pending(home.origin.id).await.unwrap();
    assert_eq!(first.failed, 0);

    let creds = home
        .store
        .device_credentials(home.device.id, ORIGIN)
        .await
        .unwrap()
        .unwrap();
    let accounts = home.transport.account_count().await;
    let rooms = home.transport.room_count().await;

    let members = load_members(home.store.as_ref(), home.db.id).await.unwrap();
    assert_eq!(members.len(), 1);
    let ops = plan_database(
        &home.entity(home.db.id).await,
        &home.channel(home.origin.id).await,
        &members,
    )
    .unwrap();
    assert!(ops.iter().any(|op| op.kind == OperationKind::RegisterDeviceAccount));
    home.store
        .commit(ChangeSet {
            operations: ops,
            ..Default::default()
        })
        .await
        .unwrap();

    let second = executor.run_pending(home.origin.id).await.unwrap();
    assert_eq!(second.failed, 0);
    assert!(second.done > 0);
    assert_eq!(home.transport.account_count().await, accounts);
    assert_eq!(home.transport.room_count().await, rooms);
    let after = home
        .store
        .device_credentials(home.device.id, ORIGIN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, creds);
}

#[tokio::test]
async fn test_operations_scheduled_on_mutex_queue_run_once() {
    let home = home().await;
    let mutex_room = home
        .transport
        .create_room(&home.alice_a, CreateRoomRequest::room("fractal-mutex"))
        .await
        .unwrap();

    let mut broker = Broker::new(
        home.transport.clone(),
        home.store.clone(),
        home.alice_a.clone(),
        home.device.id,
        vec![QueueBinding::new(QueueKind::Mutex, mutex_room.clone())],
    )
    .with_fetch_timeout(Duration::from_millis(50));
    broker.start().await.unwrap();

    let dispatcher = TaskDispatcher::new(home.transport.clone(), RetryPolicy::immediate(1));
    dispatcher
        .enqueue(
            &home.alice_a,
            &mutex_room,
            Task::run_operations(home.origin.id).unwrap(),
        )
        .await
        .unwrap();

    let mut worker = Worker::new(broker, home.pipeline()).with_retry(RetryPolicy::immediate(1));
    assert_eq!(worker.run_once().await.unwrap(), 1);

    let origin = home.channel(home.origin.id).await;
    assert!(origin.room_id().is_some());
    assert!(home.store.pending_operations(home.origin.id).await.unwrap().is_empty());
    assert!(home
        .store
        .pending_replication_logs(home.origin.id)
        .await
        .unwrap()
        .is_empty());
}

#[test]
fn test_prune_ignores_input_order() {
    let entries = vec![entry("a", 1), entry("b", 3), entry("a", 4), entry("b", 2), entry("c", 1)];
    let mut expected = prune(entries.clone());
    expected.sort_by(|x, y| x.pk.cmp(&y.pk));

    for shift in 0..entries.len() {
        let mut rotated = entries.clone();
        rotated.rotate_left(shift);
        let mut pruned = prune(rotated.clone());
        pruned.sort_by(|x, y| x.pk.cmp(&y.pk));
        assert_eq!(pruned, expected);

        rotated.reverse();
        let mut pruned = prune(rotated);
        pruned.sort_by(|x, y| x.pk.cmp(&y.pk));
        assert_eq!(pruned, expected);
    }
    let versions: Vec<_> = expected.iter().map(|e| e.object_version()).collect();
    assert_eq!(versions, vec![4, 3, 1]);
}
