mod config_cmd;
mod database;
mod run;

pub use config_cmd::ConfigCommand;
pub use database::DatabaseCommand;
pub use run::RunCommand;

use clap::ValueEnum;
use fractal_core::{save_entity, Entity, EntityKind, ReplicationError, Store};
use uuid::Uuid;

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Returns this machine's device entity, creating it on first use.
pub async fn ensure_device(store: &dyn Store, config: &Config) -> Result<Entity, ReplicationError> {
    let name = &config.device_name.value;
    if let Some(device) = store
        .entities(EntityKind::Device)
        .await?
        .into_iter()
        .find(|d| &d.name == name)
    {
        return Ok(device);
    }

    let mut device = Entity::device(name.clone());
    if let Some(matrix_id) = &config.matrix.matrix_id {
        device = device.with_owner(matrix_id.clone());
    }
    save_entity(store, device).await
}

/// Finds a root database by UUID or name.
pub async fn find_database(store: &dyn Store, identifier: &str) -> Result<Entity, ReplicationError> {
    let databases = store.entities(EntityKind::Database).await?;
    let found = match Uuid::parse_str(identifier) {
        Ok(id) => databases.into_iter().find(|db| db.id == id),
        Err(_) => databases
            .into_iter()
            .find(|db| db.name.eq_ignore_ascii_case(identifier)),
    };
    found.ok_or_else(|| ReplicationError::config(format!("database not found: {}", identifier)))
}
