use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("device_name: {}", config.device_name.value);
                        println!("  source: {}", config.device_name.source);
                        println!();

                        let matrix = &config.matrix;
                        println!(
                            "homeserver_url: {}",
                            matrix.homeserver_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "matrix_id: {}",
                            matrix.matrix_id.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "access_token: {}",
                            if matrix.access_token.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                        println!();

                        println!("queues:");
                        if config.queues.is_empty() {
                            println!("  (none)");
                        }
                        for queue in &config.queues {
                            println!("  {} {}", queue.kind, queue.room_id);
                        }
                        println!();

                        let worker = &config.worker;
                        println!("fetch_timeout_secs: {}", worker.fetch_timeout_secs);
                        println!("retry_count: {}", worker.retry_count);
                        println!("retry_backoff_ms: {}", worker.retry_backoff_ms);
                        println!("push_interval_secs: {}", worker.push_interval_secs);
                    }
                }
                Ok(())
            }
        }
    }
}
