use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::FixtureEntry;
use crate::task::Task;

/// Logical queue types polled side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Point-to-point: tasks for this device only.
    Device,
    /// Fan-out: every device runs every task.
    Broadcast,
    /// Every task runs on exactly one device.
    Mutex,
    /// Fan-out with a per-device checkpoint that starts from the beginning.
    Replication,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Device => "device",
            QueueKind::Broadcast => "broadcast",
            QueueKind::Mutex => "mutex",
            QueueKind::Replication => "replication",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(QueueKind::Device),
            "broadcast" => Some(QueueKind::Broadcast),
            "mutex" => Some(QueueKind::Mutex),
            "replication" => Some(QueueKind::Replication),
            _ => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logical queue read from one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub kind: QueueKind,
    pub room_id: String,
}

impl QueueBinding {
    pub fn new(kind: QueueKind, room_id: impl Into<String>) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
        }
    }

    /// Checkpoint name of the queue.
    pub fn name(&self) -> String {
        format!("{}:{}", self.kind, self.room_id)
    }
}

/// A task drained from a queue, with the cursor that acknowledges it.
///
/// A superseded task carries nothing left to run but its cursor must still
/// be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedTask {
    pub queue: String,
    pub kind: QueueKind,
    pub cursor: String,
    pub task: Task,
    pub superseded: bool,
}

impl ReceivedTask {
    pub fn new(queue: impl Into<String>, kind: QueueKind, cursor: impl Into<String>, task: Task) -> Self {
        Self {
            queue: queue.into(),
            kind,
            cursor: cursor.into(),
            task,
            superseded: false,
        }
    }
}

/// Marks repeated deliveries of the same task within a batch as superseded.
pub fn dedupe_tasks(mut tasks: Vec<ReceivedTask>) -> Vec<ReceivedTask> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    for received in &mut tasks {
        if !seen.insert(received.task.id) {
            received.superseded = true;
        }
    }
    tasks
}

/// Rewrites replication tasks in place so each `(model, pk)` is carried by
/// exactly one task: the one holding its highest version. Tasks left with an
/// empty fixture are marked superseded and keep their place in the batch.
pub fn prune_tasks(tasks: Vec<ReceivedTask>) -> Vec<ReceivedTask> {
    let fixtures: Vec<Option<Vec<FixtureEntry>>> = tasks
        .iter()
        .map(|received| match received.kind {
            QueueKind::Replication if !received.superseded => received.task.fixture(),
            _ => None,
        })
        .collect();

    // (model, pk) -> (task index, entry index, version)
    let mut winners: HashMap<(String, String), (usize, usize, u64)> = HashMap::new();
    for (task_index, fixture) in fixtures.iter().enumerate() {
        let Some(entries) = fixture else { continue };
        for (entry_index, entry) in entries.iter().enumerate() {
            let version = entry.object_version();
            let key = (entry.model.clone(), entry.pk.clone());
            match winners.get(&key) {
                Some(&(_, _, best)) if version <= best => {}
                _ => {
                    winners.insert(key, (task_index, entry_index, version));
                }
            }
        }
    }

    let mut pruned = Vec::with_capacity(tasks.len());
    for (task_index, (mut received, fixture)) in tasks.into_iter().zip(fixtures).enumerate() {
        let Some(entries) = fixture else {
            pruned.push(received);
            continue;
        };
        let total = entries.len();
        let kept: Vec<FixtureEntry> = entries
            .into_iter()
            .enumerate()
            .filter(|(entry_index, entry)| {
                let key = (entry.model.clone(), entry.pk.clone());
                winners
                    .get(&key)
                    .is_some_and(|&(t, e, _)| t == task_index && e == *entry_index)
            })
            .map(|(_, entry)| entry)
            .collect();

        if kept.is_empty() {
            debug!(task_id = %received.task.id, "Fixture fully superseded");
            received.superseded = true;
        } else if kept.len() != total {
            if let Err(e) = received.task.set_fixture(kept) {
                warn!(task_id = %received.task.id, error = %e, "Keeping unpruned fixture");
            }
        }
        pruned.push(received);
    }
    pruned
}
