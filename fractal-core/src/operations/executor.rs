use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::ReplicationContext;
use crate::error::{ReplicationError, Result};
use crate::models::{DurableOperation, OperationStatus, RepresentationLogEntry};
use crate::retry::RetryPolicy;
use crate::store::{ChangeSet, Store};
use crate::transport::Transport;

use super::kinds::{run, RunEnv, RunOutput};

/// Outcome of draining a channel's pending operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
}

/// Runs durable operations in creation order with a bounded retry budget.
///
/// A failing operation is marked failed once its budget is spent; the
/// operations after it still run.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    ctx: ReplicationContext,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>, ctx: ReplicationContext) -> Self {
        Self {
            store,
            transport,
            ctx,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn context(&self) -> &ReplicationContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Runs every pending operation of `channel_id`, oldest first.
    pub async fn run_pending(&self, channel_id: Uuid) -> Result<RunSummary> {
        let pending = self.store.pending_operations(channel_id).await?;
        let mut summary = RunSummary::default();

        for op in pending {
            match self.run_operation(&op).await {
                Ok(()) => summary.done += 1,
                Err(ReplicationError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        operation_id = %op.id,
                        kind = %op.kind,
                        channel_id = %channel_id,
                        error = %e,
                        "Operation failed"
                    );
                    let mut failed = op.clone();
                    failed.status = OperationStatus::Failed;
                    failed.attempts = match &e {
                        ReplicationError::RetriesExhausted { attempts, .. } => *attempts,
                        _ => 1,
                    };
                    failed.last_error = Some(e.to_string());
                    self.store
                        .commit(ChangeSet {
                            operations: vec![failed],
                            ..Default::default()
                        })
                        .await?;
                }
            }
        }

        if summary.done + summary.failed > 0 {
            info!(
                channel_id = %channel_id,
                done = summary.done,
                failed = summary.failed,
                "Ran pending operations"
            );
        }
        Ok(summary)
    }

    /// Runs one operation with retries and marks it done.
    pub async fn run_operation(&self, op: &DurableOperation) -> Result<()> {
        info!(operation_id = %op.id, kind = %op.kind, instance = %op.instance, "Running operation");
        let output = self.run_with_retry(op).await?;

        let mut done = op.clone();
        done.status = OperationStatus::Done;
        done.last_error = None;
        let mut changes = ChangeSet {
            operations: vec![done],
            ..Default::default()
        };
        Self::collect_output(&mut changes, output);
        self.store.commit(changes).await?;
        Ok(())
    }

    /// Applies one representation step and marks it consumed.
    pub async fn apply_representation(&self, step: &RepresentationLogEntry) -> Result<()> {
        let op = step.to_operation();
        info!(step_id = %step.id, kind = %op.kind, instance = %op.instance, "Applying representation step");
        let output = self.run_with_retry(&op).await?;

        let mut consumed = step.clone();
        consumed.deleted = true;
        let mut changes = ChangeSet {
            representation_logs: vec![consumed],
            ..Default::default()
        };
        Self::collect_output(&mut changes, output);
        self.store.commit(changes).await?;
        Ok(())
    }

    async fn run_with_retry(&self, op: &DurableOperation) -> Result<RunOutput> {
        let env = RunEnv {
            ctx: &self.ctx,
            store: self.store.as_ref(),
            transport: self.transport.as_ref(),
        };
        self.retry
            .run(op.kind.tag(), || run(&env, op))
            .await
    }

    /// Queues metadata patches for the store to merge at commit time, so a
    /// concurrent edit of the target is never overwritten.
    fn collect_output(changes: &mut ChangeSet, output: RunOutput) {
        for (target, patch) in output.patches {
            changes.patch_metadata(target, patch);
        }
        if let Some(credentials) = output.credentials {
            changes.credentials.push(credentials);
        }
    }
}
