use clap::{Args, Subcommand};
use fractal_core::{
    add_channel, save_entity, Channel, Entity, EntityKind, RetryPolicy, Store, Task,
    TaskDispatcher,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{ensure_device, find_database, OutputFormat};
use crate::config::Config;
use crate::transport::HttpTransport;

#[derive(Args)]
pub struct DatabaseCommand {
    #[command(subcommand)]
    pub command: DatabaseSubcommand,
}

#[derive(Subcommand)]
pub enum DatabaseSubcommand {
    /// Create a root database and join this device to it
    Create {
        /// Name of the database
        name: String,
    },

    /// List databases and their channels
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Add an app (or service) database under a root database
    AddApp {
        /// Root database ID (UUID) or name
        database: String,

        /// Name of the app
        name: String,

        /// Create a service instead of an app
        #[arg(long)]
        service: bool,
    },

    /// Bind a database to a homeserver; the first one becomes the origin
    AddChannel {
        /// Root database ID (UUID) or name
        database: String,

        /// Homeserver URL
        endpoint: String,

        /// Channel name
        #[arg(long)]
        name: Option<String>,
    },
}

impl DatabaseCommand {
    pub async fn run(
        &self,
        store: &dyn Store,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            DatabaseSubcommand::Create { name } => {
                let device = ensure_device(store, config).await?;
                let database = save_entity(store, Entity::database(name.clone())).await?;
                save_entity(store, Entity::membership(&device, &database)).await?;
                println!("Created database: {} ({})", database.name, database.id);
                println!("  member: {} ({})", device.name, device.id);
            }
            DatabaseSubcommand::List { format } => {
                let databases = store.entities(EntityKind::Database).await?;
                let mut rows = Vec::with_capacity(databases.len());
                for database in databases {
                    let channels = store.channels(database.id).await?;
                    rows.push((database, channels));
                }

                match format {
                    OutputFormat::Json => {
                        let listing: Vec<_> = rows
                            .iter()
                            .map(|(database, channels)| {
                                json!({ "database": database, "channels": channels })
                            })
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&listing)?);
                    }
                    OutputFormat::Text => {
                        if rows.is_empty() {
                            println!("No databases found.");
                        }
                        for (database, channels) in &rows {
                            println!("{} ({})", database.name, database.id);
                            for channel in channels.iter().filter(|c| !c.deleted) {
                                println!(
                                    "  {}{} room: {}",
                                    channel.endpoint,
                                    if channel.origin { " [origin]" } else { "" },
                                    channel.room_id().unwrap_or("-")
                                );
                            }
                        }
                    }
                }
            }
            DatabaseSubcommand::AddApp {
                database,
                name,
                service,
            } => {
                let parent = find_database(store, database).await?;
                let entity = if *service {
                    Entity::service(name.clone(), &parent)
                } else {
                    Entity::app(name.clone(), &parent)
                };
                let entity = save_entity(store, entity).await?;
                println!(
                    "Added {}: {} ({}) to {}",
                    entity.kind.model_name(),
                    entity.name,
                    entity.id,
                    parent.name
                );
            }
            DatabaseSubcommand::AddChannel {
                database,
                endpoint,
                name,
            } => {
                let database = find_database(store, database).await?;
                let mut channel = Channel::new(database.id, endpoint.clone());
                if let Some(name) = name {
                    channel = channel.with_name(name.clone());
                }
                let added = add_channel(store, channel).await?;
                println!("Added channel: {}", added.channel);
                println!("  origin: {}", added.channel.origin);
                println!("  planned operations: {}", added.operations.len());
                println!("  snapshot entries: {}", added.snapshot_len);

                match (config.matrix.session(), config.mutex_queue()) {
                    (Some(session), Some(queue)) => {
                        let retry = RetryPolicy::new(
                            config.worker.retry_count,
                            config.worker.retry_backoff(),
                        );
                        let dispatcher = TaskDispatcher::new(Arc::new(HttpTransport::new()), retry);
                        let task = Task::run_operations(added.channel.id)?;
                        let event_id = dispatcher.enqueue(&session, &queue.room_id, task).await?;
                        info!(
                            channel = %added.channel,
                            queue = %queue.room_id,
                            event_id = %event_id,
                            "Scheduled operations"
                        );
                        println!("  scheduled on: {}", queue.room_id);
                    }
                    _ => println!("  operations run with the next `fractal-worker run`"),
                }
            }
        }
        Ok(())
    }
}
