use clap::Args;
use fractal_core::consumer::{Broker, QueueBinding, QueueKind, Worker};
use fractal_core::{
    EntityKind, Executor, Pipeline, ReplicationContext, ReplicationError, RetryPolicy, Store,
    TaskDispatcher, Transport,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::ensure_device;
use crate::config::Config;
use crate::transport::HttpTransport;

#[derive(Args)]
pub struct RunCommand {
    /// Extra replication queue room to consume (can be repeated)
    #[arg(long = "queue", value_name = "ROOM_ID")]
    pub queues: Vec<String>,

    /// Push local changes, handle one batch of tasks and exit
    #[arg(long)]
    pub once: bool,
}

impl RunCommand {
    pub async fn run(
        &self,
        store: Arc<dyn Store>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(session) = config.matrix.session() else {
            return Err("matrix homeserver_url, access_token and matrix_id must be configured".into());
        };
        let homeserver = session.endpoint.clone();

        let device = ensure_device(store.as_ref(), config).await?;
        let databases = store.entities(EntityKind::Database).await?;
        let database_id = databases.first().map(|db| db.id).unwrap_or_else(Uuid::nil);

        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
        let retry = RetryPolicy::new(config.worker.retry_count, config.worker.retry_backoff());
        let ctx = ReplicationContext::new(device.id, database_id).with_session(session.clone());
        let executor = Executor::new(store.clone(), transport.clone(), ctx).with_retry(retry);
        let pipeline = Pipeline::new(executor, TaskDispatcher::new(transport.clone(), retry));

        let mut bindings: Vec<QueueBinding> = config.queues.iter().map(QueueBinding::from).collect();
        bindings.extend(
            self.queues
                .iter()
                .map(|room_id| QueueBinding::new(QueueKind::Replication, room_id.clone())),
        );
        for database in &databases {
            for channel in store.channels(database.id).await? {
                if channel.deleted || channel.endpoint != homeserver {
                    continue;
                }
                if let Some(room_id) = channel.room_id() {
                    bindings.push(QueueBinding::new(QueueKind::Replication, room_id));
                }
            }
        }
        bindings.sort_by_key(|b| b.name());
        bindings.dedup_by_key(|b| b.name());

        info!(
            device = %device,
            homeserver = %homeserver,
            queues = bindings.len(),
            "Starting worker"
        );

        if self.once {
            push_local_changes(store.as_ref(), &pipeline, &homeserver).await?;
            if !bindings.is_empty() {
                let broker = Broker::new(transport, store, session, device.id, bindings)
                    .with_fetch_timeout(config.worker.fetch_timeout());
                let mut worker = Worker::new(broker, pipeline).with_retry(retry);
                let handled = worker.run_once().await?;
                info!(tasks = handled, "Handled one batch");
            }
            return Ok(());
        }

        let pusher = {
            let store = store.clone();
            let pipeline = pipeline.clone();
            let homeserver = homeserver.clone();
            let mut interval = tokio::time::interval(config.worker.push_interval());
            tokio::spawn(async move {
                loop {
                    interval.tick().await;
                    if let Err(e) = push_local_changes(store.as_ref(), &pipeline, &homeserver).await {
                        warn!(error = %e, "Pushing local changes failed");
                    }
                }
            })
        };

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        };

        let result = if bindings.is_empty() {
            warn!("No queues bound; only pushing local changes");
            shutdown.await;
            Ok(())
        } else {
            let broker = Broker::new(transport, store, session, device.id, bindings)
                .with_fetch_timeout(config.worker.fetch_timeout());
            let mut worker = Worker::new(broker, pipeline).with_retry(retry);
            worker.run_until(shutdown).await
        };

        pusher.abort();
        result?;
        Ok(())
    }
}

/// Runs pending operations and pushes pending logs on every channel this
/// worker has a session for.
async fn push_local_changes(
    store: &dyn Store,
    pipeline: &Pipeline,
    homeserver: &str,
) -> Result<(), ReplicationError> {
    for database in store.entities(EntityKind::Database).await? {
        for channel in store.channels(database.id).await? {
            if channel.deleted || !channel.is_active_target() || channel.endpoint != homeserver {
                continue;
            }
            let summary = pipeline.executor().run_pending(channel.id).await?;
            if summary.failed > 0 {
                warn!(channel = %channel, failed = summary.failed, "Some operations failed");
            }
            match pipeline.replicate(channel.id).await {
                Ok(report) if report.batches > 0 => {
                    info!(channel = %channel, entries = report.entries, "Pushed local changes");
                }
                Ok(_) => {}
                Err(e) => warn!(channel = %channel, error = %e, "Replication push failed"),
            }
        }
    }
    Ok(())
}
