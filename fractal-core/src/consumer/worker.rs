use std::future::Future;
use tracing::{debug, error, info};

use crate::error::{ReplicationError, Result};
use crate::replication::{apply_fixture, Pipeline};
use crate::retry::RetryPolicy;
use crate::task::{RunOperationsArgs, Task, REPLICATE_FIXTURE, RUN_OPERATIONS};

use super::broker::Broker;

/// Runs the tasks a [`Broker`] receives.
pub struct Worker {
    broker: Broker,
    pipeline: Pipeline,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(broker: Broker, pipeline: Pipeline) -> Self {
        Self {
            broker,
            pipeline,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Runs one batch and returns how many tasks it handled.
    ///
    /// Every task is acknowledged once handled, including tasks that failed
    /// for good, so a poisoned task never blocks its queue. Superseded tasks
    /// are acknowledged without running.
    pub async fn run_once(&mut self) -> Result<usize> {
        let batch = self.broker.next_batch().await?;
        let mut handled = 0;
        for received in &batch {
            let task = &received.task;
            if received.superseded {
                debug!(task_id = %task.id, queue = %received.queue, "Skipping superseded task");
                self.broker.ack(received).await?;
                continue;
            }
            handled += 1;
            let outcome = self.retry.run(&task.name, || self.handle(task)).await;
            match outcome {
                Ok(()) => debug!(task_id = %task.id, name = %task.name, "Task done"),
                Err(e) => error!(
                    task_id = %task.id,
                    name = %task.name,
                    queue = %received.queue,
                    error = %e,
                    "Task failed"
                ),
            }
            self.broker.ack(received).await?;
        }
        Ok(handled)
    }

    /// Runs batches until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(device_id = %self.broker.device_id(), "Worker started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Worker stopping");
                    return Ok(());
                }
                result = self.run_once() => {
                    result?;
                }
            }
        }
    }

    /// Dispatches one task by name.
    pub async fn handle(&self, task: &Task) -> Result<()> {
        match task.name.as_str() {
            REPLICATE_FIXTURE => {
                let fixture = task.fixture().ok_or_else(|| {
                    ReplicationError::Serialization(format!("task {} has no fixture", task.id))
                })?;
                let report = apply_fixture(self.pipeline.executor().store().as_ref(), &fixture).await?;
                debug!(applied = report.applied, skipped = report.skipped, "Applied replicated fixture");
                Ok(())
            }
            RUN_OPERATIONS => {
                let args: RunOperationsArgs = serde_json::from_value(task.args.clone())?;
                self.pipeline.executor().run_pending(args.channel_id).await?;
                self.pipeline.replicate(args.channel_id).await?;
                Ok(())
            }
            other => Err(ReplicationError::config(format!("unknown task {}", other))),
        }
    }
}
