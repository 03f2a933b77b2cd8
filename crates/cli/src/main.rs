mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tidemark_core::{init_tracing, LogFormat, TidemarkConfig, DEFAULT_CONFIG_PATH};

use commands::migrate;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(version, about = "Versioned schema migrations for PostgreSQL and SQLite")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database migration management
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Create a new SQL migration file
    Create {
        /// Migration name
        name: String,
    },

    /// Run pending migrations
    Run {
        /// Stop after this version
        #[arg(long)]
        target: Option<i64>,
    },

    /// Roll back applied migrations
    Rollback {
        /// Number of migrations to roll back
        #[arg(long, default_value_t = 1, conflicts_with = "batch")]
        steps: usize,

        /// Roll back the whole last batch instead
        #[arg(long)]
        batch: bool,
    },

    /// Show migration status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply a single migration
    Up {
        version: i64,
    },

    /// Revert a single migration
    Down {
        version: i64,
    },

    /// Roll back and re-apply migrations
    Redo {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },

    /// List migrations a run would apply
    Pending {
        #[arg(long)]
        target: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TidemarkConfig::load(&cli.config)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Migrate { migrate_command } => match migrate_command {
            MigrateCommands::Create { name } => {
                migrate::create(&config, &name)?;
            }
            MigrateCommands::Run { target } => {
                migrate::run(&config, target).await?;
            }
            MigrateCommands::Rollback { steps, batch } => {
                migrate::rollback(&config, steps, batch).await?;
            }
            MigrateCommands::Status { json } => {
                migrate::status(&config, json).await?;
            }
            MigrateCommands::Up { version } => {
                migrate::up(&config, version).await?;
            }
            MigrateCommands::Down { version } => {
                migrate::down(&config, version).await?;
            }
            MigrateCommands::Redo { steps } => {
                migrate::redo(&config, steps).await?;
            }
            MigrateCommands::Pending { target } => {
                migrate::pending(&config, target).await?;
            }
        },
    }

    Ok(())
}
