mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use commands::*;
use dbver_migrate::{DatabaseConfig, MigrationConfig};

#[derive(Parser)]
#[command(name = "dbver")]
#[command(about = "Apply numbered SQL migrations tracked by a single version row")]
#[command(version)]
struct Cli {
    /// Emit logs and command output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level used when RUST_LOG is not set (falls back to LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Connection URL, overrides DATABASE_URL and the DB_* variables
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding <version>.sql files
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Warn instead of failing when the last applied file was modified
    #[arg(long, global = true)]
    allow_drift: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migration management
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },

    /// Check that the database is reachable
    Ping,
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply every pending migration
    Run,

    /// Show the recorded version and which migrations are pending
    Status,

    /// Create the next numbered migration file
    Create {
        /// Migration name, written into the file header
        name: String,
    },

    /// Mark a failed migration complete after fixing it by hand
    Resolve {
        /// Version currently recorded as incomplete
        version: u64,
    },
}

impl Cli {
    fn database_config(&self) -> anyhow::Result<DatabaseConfig> {
        DatabaseConfig::from_lookup(|key| match (key, &self.database_url) {
            ("DATABASE_URL", Some(url)) => Some(url.clone()),
            _ => std::env::var(key).ok(),
        })
        .context("invalid database configuration")
    }

    fn migration_config(&self) -> anyhow::Result<MigrationConfig> {
        let mut config = MigrationConfig::from_env().context("invalid migration configuration")?;
        if let Some(dir) = &self.migrations_dir {
            config.migrations_dir = dir.clone();
        }
        if self.allow_drift {
            config.allow_drift = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    logging::init_logging(&level, cli.json)?;

    let output = if cli.json {
        Output::Json
    } else {
        Output::Text
    };

    match &cli.command {
        Commands::Migrate { migrate_command } => match migrate_command {
            MigrateCommands::Run => {
                migrate::run(&cli.database_config()?, cli.migration_config()?, output).await?;
            }
            MigrateCommands::Status => {
                migrate::status(&cli.database_config()?, cli.migration_config()?, output).await?;
            }
            MigrateCommands::Create { name } => {
                migrate::create(cli.migration_config()?, name, output).await?;
            }
            MigrateCommands::Resolve { version } => {
                migrate::resolve(
                    &cli.database_config()?,
                    cli.migration_config()?,
                    *version,
                    output,
                )
                .await?;
            }
        },
        Commands::Ping => {
            ping::run(&cli.database_config()?, output).await?;
        }
    }

    Ok(())
}
