use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Credentials;
use crate::error::{Result, TransportError};
use crate::models::Checkpoint;
use crate::store::{ChangeSet, Store};
use crate::task::{Task, DEVICE_LABEL, TASK_EVENT};
use crate::transport::{CreateRoomRequest, Event, EventBatch, Transport};

use super::queue::{dedupe_tasks, prune_tasks, QueueBinding, QueueKind, ReceivedTask};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Alias prefix of the rooms that elect the device running a mutex task.
pub const LOCK_ALIAS_PREFIX: &str = "fractal-lock-";

const FETCH_GRACE: Duration = Duration::from_secs(5);
const ERROR_DELAY: Duration = Duration::from_secs(1);

type Fetched = (usize, std::result::Result<EventBatch, TransportError>);

struct QueueState {
    binding: QueueBinding,
    name: String,
    /// Read position of the next fetch, ahead of the stored checkpoint.
    cursor: Option<String>,
}

/// Polls every bound queue concurrently and hands out batches of tasks.
///
/// Each queue has at most one fetch in flight. Reading ahead never moves a
/// checkpoint; only [`Broker::ack`] does.
pub struct Broker {
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    session: Credentials,
    device_id: Uuid,
    fetch_timeout: Duration,
    queues: Vec<QueueState>,
    in_flight: FuturesUnordered<BoxFuture<'static, Fetched>>,
    started: bool,
}

impl Broker {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        session: Credentials,
        device_id: Uuid,
        bindings: Vec<QueueBinding>,
    ) -> Self {
        let queues = bindings
            .into_iter()
            .map(|binding| QueueState {
                name: binding.name(),
                binding,
                cursor: None,
            })
            .collect();
        Self {
            transport,
            store,
            session,
            device_id,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            queues,
            in_flight: FuturesUnordered::new(),
            started: false,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// Positions every queue and issues the first fetches.
    ///
    /// A queue resumes from its checkpoint. Without one, a replication queue
    /// is read from the beginning while the others start at the current head.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        for queue in &mut self.queues {
            let saved = self.store.checkpoint(&queue.name, self.device_id).await?;
            queue.cursor = match saved {
                Some(checkpoint) => checkpoint.cursor,
                None if queue.binding.kind == QueueKind::Replication => {
                    info!(queue = %queue.name, "No checkpoint, reading queue from the start");
                    None
                }
                None => {
                    let head = self
                        .transport
                        .head_cursor(&self.session, &queue.binding.room_id)
                        .await?;
                    self.store
                        .commit(ChangeSet {
                            checkpoints: vec![Checkpoint::new(
                                queue.name.clone(),
                                self.device_id,
                                head.clone(),
                            )],
                            ..Default::default()
                        })
                        .await?;
                    head
                }
            };
            debug!(queue = %queue.name, cursor = ?queue.cursor, "Queue positioned");
        }
        for index in 0..self.queues.len() {
            self.spawn_fetch(index, Duration::ZERO);
        }
        self.started = true;
        Ok(())
    }

    /// Waits for the next non-empty batch across all queues.
    ///
    /// The first completed fetch is taken together with any others already
    /// finished. Repeated deliveries are dropped and replication fixtures are
    /// pruned across the batch. With no queues bound this returns an empty
    /// batch at once.
    pub async fn next_batch(&mut self) -> Result<Vec<ReceivedTask>> {
        self.start().await?;
        loop {
            let Some((index, fetched)) = self.in_flight.next().await else {
                return Ok(Vec::new());
            };
            let mut tasks = self.ingest(index, fetched).await;

            for _ in 1..self.queues.len() {
                let ready = self.in_flight.next().now_or_never();
                match ready {
                    Some(Some((index, fetched))) => tasks.extend(self.ingest(index, fetched).await),
                    _ => break,
                }
            }

            if !tasks.is_empty() {
                return Ok(prune_tasks(dedupe_tasks(tasks)));
            }
        }
    }

    /// Moves the queue's checkpoint up to `received`.
    ///
    /// An ack that orders before the saved cursor is ignored. Cursors that
    /// cannot be ordered against the saved one replace it, so acks must
    /// follow delivery order.
    pub async fn ack(&self, received: &ReceivedTask) -> Result<()> {
        let saved = self.store.checkpoint(&received.queue, self.device_id).await?;
        let current = saved.as_ref().and_then(|c| c.cursor.as_deref());
        if saved.is_some() && !cursor_advances(current, &received.cursor) {
            return Ok(());
        }
        self.store
            .commit(ChangeSet {
                checkpoints: vec![Checkpoint::new(
                    received.queue.clone(),
                    self.device_id,
                    Some(received.cursor.clone()),
                )],
                ..Default::default()
            })
            .await?;
        debug!(queue = %received.queue, cursor = %received.cursor, "Acknowledged task");
        Ok(())
    }

    fn spawn_fetch(&mut self, index: usize, delay: Duration) {
        let queue = &self.queues[index];
        let transport = self.transport.clone();
        let session = self.session.clone();
        let room_id = queue.binding.room_id.clone();
        let cursor = queue.cursor.clone();
        let timeout = self.fetch_timeout;

        self.in_flight.push(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let fetch = transport.fetch_events(&session, &room_id, cursor.as_deref(), timeout);
                let fetched = match tokio::time::timeout(timeout + FETCH_GRACE, fetch).await {
                    Ok(result) => result,
                    Err(_) => Ok(EventBatch {
                        events: Vec::new(),
                        next_cursor: cursor.clone(),
                    }),
                };
                (index, fetched)
            }
            .boxed(),
        );
    }

    /// Records a finished fetch, re-issues it and returns the tasks it
    /// carried for this device.
    async fn ingest(
        &mut self,
        index: usize,
        fetched: std::result::Result<EventBatch, TransportError>,
    ) -> Vec<ReceivedTask> {
        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) => {
                warn!(queue = %self.queues[index].name, error = %e, "Fetch failed");
                self.spawn_fetch(index, ERROR_DELAY);
                return Vec::new();
            }
        };

        if let Some(next) = batch.next_cursor {
            self.queues[index].cursor = Some(next);
        }
        self.spawn_fetch(index, Duration::ZERO);

        let queue = &self.queues[index];
        let transport = self.transport.as_ref();
        let session = &self.session;
        let mut tasks = Vec::new();
        for event in batch.events {
            let Some(task) = parse_task(self.device_id, &queue.name, &event) else {
                continue;
            };
            if queue.binding.kind == QueueKind::Mutex {
                match claim(transport, session, &task).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task.id, "Task claimed by another device");
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "Could not claim task");
                        continue;
                    }
                }
            }
            tasks.push(ReceivedTask::new(
                queue.name.clone(),
                queue.binding.kind,
                event.cursor,
                task,
            ));
        }
        tasks
    }
}

fn parse_task(device_id: Uuid, queue: &str, event: &Event) -> Option<Task> {
    if event.event_type != TASK_EVENT {
        return None;
    }
    let task: Task = match serde_json::from_value(event.content.clone()) {
        Ok(task) => task,
        Err(e) => {
            warn!(queue, event_id = %event.event_id, error = %e, "Skipping malformed task");
            return None;
        }
    };
    match task.labels.get(DEVICE_LABEL) {
        Some(target) if *target != device_id.to_string() => None,
        _ => Some(task),
    }
}

/// Claims a mutex task by creating a room under an alias derived from the
/// task id. The server lets exactly one creation of an alias succeed.
async fn claim(
    transport: &dyn Transport,
    session: &Credentials,
    task: &Task,
) -> std::result::Result<bool, TransportError> {
    let request = CreateRoomRequest::room(format!("lock {}", task.id))
        .with_alias(format!("{}{}", LOCK_ALIAS_PREFIX, task.id));
    match transport.create_room(session, request).await {
        Ok(_) => Ok(true),
        Err(TransportError::AlreadyExists(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn split_cursor(cursor: &str) -> Option<(&str, u64)> {
    let (token, skip) = cursor.rsplit_once('|')?;
    Some((token, skip.parse().ok()?))
}

/// Numeric cursors and `<token>|<n>` cursors sharing a token must grow.
/// Cursors on different tokens cannot be ordered and only need to differ.
fn cursor_advances(current: Option<&str>, next: &str) -> bool {
    let Some(current) = current else {
        return true;
    };
    if let (Ok(current), Ok(next)) = (current.parse::<u64>(), next.parse::<u64>()) {
        return next > current;
    }
    match (split_cursor(current), split_cursor(next)) {
        (Some((current_token, current_skip)), Some((next_token, next_skip)))
            if current_token == next_token =>
        {
            next_skip > current_skip
        }
        _ => current != next,
    }
}
