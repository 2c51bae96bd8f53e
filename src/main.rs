use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod db;
mod transport;

use commands::{ConfigCommand, DatabaseCommand, RunCommand};
use config::Config;
use db::{init_db, SqliteStore};

#[derive(Parser)]
#[command(name = "fractal-worker")]
#[command(version)]
#[command(about = "Replicates databases across Matrix homeservers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication worker
    Run(RunCommand),

    /// Manage local databases and their channels
    Database(DatabaseCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fractal_worker=info,fractal_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let pool = init_db(&config.database_path.value).await?;
            let store = Arc::new(SqliteStore::new(pool));
            cmd.run(store, &config).await?;
        }
        Some(Commands::Database(cmd)) => {
            let pool = init_db(&config.database_path.value).await?;
            let store = SqliteStore::new(pool);
            cmd.run(&store, &config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
