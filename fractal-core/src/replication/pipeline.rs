use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ReplicationError, Result, StoreError};
use crate::models::{Channel, ReplicationLogEntry};
use crate::operations::{load_members, plan_database, Executor};
use crate::store::ChangeSet;
use crate::task::{Task, TaskDispatcher};

use super::{encode_fixture, prune};

/// Push attempts per `replicate` call: the first, and one more after
/// bootstrapping a channel whose structure was missing.
pub const MAX_PUSH_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Fixtures broadcast, one per transaction.
    pub batches: usize,
    /// Entries broadcast after pruning.
    pub entries: usize,
}

/// Gathers unconsumed replication logs per transaction, applies their
/// representation steps, prunes and pushes one fixture per transaction.
#[derive(Clone)]
pub struct Pipeline {
    executor: Executor,
    dispatcher: TaskDispatcher,
}

impl Pipeline {
    pub fn new(executor: Executor, dispatcher: TaskDispatcher) -> Self {
        Self {
            executor,
            dispatcher,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Pushes everything pending on `channel_id`. A channel without its root
    /// space is bootstrapped once, then the push is tried again; a second
    /// miss is terminal.
    ///
    /// Without a session for the channel's endpoint this fails with
    /// `AuthenticationRequired` before anything is planned or run.
    pub async fn replicate(&self, channel_id: Uuid) -> Result<PushReport> {
        let channel = self.channel(channel_id).await?;
        self.executor.context().session_for(&channel.endpoint)?;

        let mut last = String::new();
        for attempt in 1..=MAX_PUSH_ATTEMPTS {
            match self.push_pending(channel_id).await {
                Ok(report) => return Ok(report),
                Err(ReplicationError::MissingPrerequisite(what)) => {
                    warn!(channel_id = %channel_id, attempt, missing = %what, "Cannot push yet");
                    last = what;
                    if attempt < MAX_PUSH_ATTEMPTS {
                        self.bootstrap(channel_id).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ReplicationError::RetriesExhausted {
            attempts: MAX_PUSH_ATTEMPTS,
            last,
        })
    }

    async fn channel(&self, channel_id: Uuid) -> Result<Channel> {
        self.executor
            .store()
            .channel(channel_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("channel {}", channel_id)).into())
    }

    async fn push_pending(&self, channel_id: Uuid) -> Result<PushReport> {
        let store = self.executor.store();
        let logs = store.pending_replication_logs(channel_id).await?;
        let mut report = PushReport::default();
        if logs.is_empty() {
            return Ok(report);
        }

        for (txn_id, group) in group_by_transaction(logs) {
            let mut fixture = Vec::with_capacity(group.len());
            for log in &group {
                for step in store.pending_representation_logs(log.id).await? {
                    self.executor.apply_representation(&step).await?;
                }
                fixture.push(log.payload.clone());
            }

            // Representation steps may have just realized the channel.
            let channel = self.channel(channel_id).await?;
            let room_id = channel.room_id().ok_or_else(|| {
                ReplicationError::missing(format!("channel {} has no room_id", channel.id))
            })?;
            let session = self.executor.context().session_for(&channel.endpoint)?;

            let pruned = prune(fixture);
            let entries = pruned.len();
            let task = Task::replicate_fixture(encode_fixture(&pruned))?;
            self.dispatcher.enqueue(session, room_id, task).await?;

            let consumed = group
                .into_iter()
                .map(|mut log| {
                    log.deleted = true;
                    log
                })
                .collect();
            store
                .commit(ChangeSet {
                    replication_logs: consumed,
                    ..Default::default()
                })
                .await?;

            debug!(txn_id = %txn_id, room_id, entries, "Pushed fixture");
            report.batches += 1;
            report.entries += entries;
        }

        info!(
            channel_id = %channel_id,
            batches = report.batches,
            entries = report.entries,
            "Replicated pending logs"
        );
        Ok(report)
    }

    /// Plans the channel's structure when nothing is queued for it, then
    /// runs what is pending.
    async fn bootstrap(&self, channel_id: Uuid) -> Result<()> {
        let store = self.executor.store();
        let channel = self.channel(channel_id).await?;

        if store.pending_operations(channel.id).await?.is_empty() {
            let database = store.entity(channel.database_id).await?.ok_or_else(|| {
                ReplicationError::missing(format!("database {}", channel.database_id))
            })?;
            let members = load_members(store.as_ref(), database.id).await?;
            let operations = plan_database(&database, &channel, &members)?;
            info!(channel_id = %channel.id, count = operations.len(), "Planned channel bootstrap");
            store
                .commit(ChangeSet {
                    operations,
                    ..Default::default()
                })
                .await?;
        }

        self.executor.run_pending(channel.id).await?;
        Ok(())
    }
}

/// Groups logs by transaction, ordered by each transaction's first entry.
fn group_by_transaction(logs: Vec<ReplicationLogEntry>) -> Vec<(Uuid, Vec<ReplicationLogEntry>)> {
    let mut positions: HashMap<Uuid, usize> = HashMap::new();
    let mut groups: Vec<(Uuid, Vec<ReplicationLogEntry>)> = Vec::new();
    for log in logs {
        match positions.get(&log.txn_id) {
            Some(&index) => groups[index].1.push(log),
            None => {
                positions.insert(log.txn_id, groups.len());
                groups.push((log.txn_id, vec![log]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FixtureEntry, InstanceKind, InstanceRef};

    fn log(txn_id: Uuid, pk: &str) -> ReplicationLogEntry {
        ReplicationLogEntry::new(
            txn_id,
            Uuid::new_v4(),
            InstanceRef::new(InstanceKind::Device, Uuid::new_v4()),
            FixtureEntry::new("fractal.device", pk, Default::default()),
        )
    }

    #[test]
    fn test_grouping_keeps_first_seen_transaction_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let groups = group_by_transaction(vec![log(a, "1"), log(b, "2"), log(a, "3")]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        let pks: Vec<_> = groups[0].1.iter().map(|l| l.payload.pk.as_str()).collect();
        assert_eq!(pks, vec!["1", "3"]);
        assert_eq!(groups[1].0, b);
    }
}
