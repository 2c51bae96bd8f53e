//! Task envelopes carried over the transport and the dispatcher that sends
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::context::Credentials;
use crate::error::{ReplicationError, Result};
use crate::models::FixtureEntry;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Timeline event type of a task message.
pub const TASK_EVENT: &str = "f.task";
/// Applies a fixture on the receiving device.
pub const REPLICATE_FIXTURE: &str = "replicate_fixture";
/// Runs the pending durable operations of a channel.
pub const RUN_OPERATIONS: &str = "run_operations";

/// Routing label naming the room a task was sent to.
pub const ROOM_LABEL: &str = "room_id";
/// Routing label restricting a task to one device.
pub const DEVICE_LABEL: &str = "device_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateFixtureArgs {
    pub fixture: Vec<FixtureEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOperationsArgs {
    pub channel_id: Uuid,
}

impl Task {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            labels: BTreeMap::new(),
        }
    }

    pub fn replicate_fixture(fixture: Vec<FixtureEntry>) -> serde_json::Result<Self> {
        let args = serde_json::to_value(ReplicateFixtureArgs { fixture })?;
        Ok(Self::new(REPLICATE_FIXTURE, args))
    }

    pub fn run_operations(channel_id: Uuid) -> serde_json::Result<Self> {
        let args = serde_json::to_value(RunOperationsArgs { channel_id })?;
        Ok(Self::new(RUN_OPERATIONS, args))
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The fixture of a `replicate_fixture` task, `None` for other tasks.
    pub fn fixture(&self) -> Option<Vec<FixtureEntry>> {
        if self.name != REPLICATE_FIXTURE {
            return None;
        }
        serde_json::from_value::<ReplicateFixtureArgs>(self.args.clone())
            .ok()
            .map(|args| args.fixture)
    }

    pub fn set_fixture(&mut self, fixture: Vec<FixtureEntry>) -> serde_json::Result<()> {
        self.args = serde_json::to_value(ReplicateFixtureArgs { fixture })?;
        Ok(())
    }
}

/// Durable task enqueue: one timeline event per task in the destination
/// room, sent with the bounded retry policy.
#[derive(Clone)]
pub struct TaskDispatcher {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Sends `task` to `room_id` and returns the event id.
    pub async fn enqueue(&self, session: &Credentials, room_id: &str, task: Task) -> Result<String> {
        let task = task.with_label(ROOM_LABEL, room_id);
        let content = serde_json::to_value(&task)?;
        let event_id = self
            .retry
            .run(&task.name, || async {
                self.transport
                    .send_event(session, room_id, TASK_EVENT, content.clone())
                    .await
                    .map_err(ReplicationError::from)
            })
            .await?;
        debug!(room_id, task = %task.name, task_id = %task.id, event_id = %event_id, "Enqueued task");
        Ok(event_id)
    }
}
