use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::env;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use journal_sync::{LocalStoreConfig, SqliteStorage};

mod commands;

use commands::Operation;

/// Class Journal encrypted sync
#[derive(Parser, Debug)]
#[command(name = "class-journal", version)]
#[command(about = "Sync the local Class Journal database with its encrypted remote copy")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Remote store to talk to
    #[arg(long, value_enum, env = "JOURNAL_REMOTE", default_value_t = RemoteKind::Http, global = true)]
    remote: RemoteKind,

    /// Account whose remote copy is used
    #[arg(long, env = "JOURNAL_OWNER", global = true)]
    owner: Option<String>,

    /// Encryption passphrase
    #[arg(long, env = "JOURNAL_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Bearer token for the HTTP or Drive remote
    #[arg(long, env = "JOURNAL_ACCESS_TOKEN", hide_env_values = true, global = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the local document and sync metadata
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move legacy single-class data into the current layout
    Migrate,
    /// Upload local data
    Push {
        /// Overwrite the remote copy when it changed elsewhere
        #[arg(long)]
        force: bool,
    },
    /// Replace local data with the remote copy
    Pull {
        /// Discard unsynced local changes
        #[arg(long)]
        force: bool,
    },
    /// Merge the remote copy into local data and upload the result
    Merge,
    /// Keep syncing in the foreground until interrupted
    Watch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RemoteKind {
    /// PostgREST endpoint from `JOURNAL_REMOTE_URL`
    Http,
    /// Backup file in the account's Google Drive
    Drive,
    /// In-process store, discarded on exit
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    let store_config = LocalStoreConfig::from_env()?;
    let storage = Arc::new(
        SqliteStorage::open(&store_config)
            .await
            .with_context(|| format!("opening {}", store_config.db_path.display()))?,
    );

    let result = match &cli.command {
        Command::Status { json } => commands::show_status(storage.clone(), *json).await,
        Command::Migrate => commands::migrate(storage.as_ref()).await,
        Command::Push { force } => {
            commands::run_operation(&cli, storage.clone(), Operation::Push { force: *force }).await
        }
        Command::Pull { force } => {
            commands::run_operation(&cli, storage.clone(), Operation::Pull { force: *force }).await
        }
        Command::Merge => commands::run_operation(&cli, storage.clone(), Operation::Merge).await,
        Command::Watch => commands::watch(&cli, storage.clone()).await,
    };

    storage.close().await;
    result
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("journal_sync={level},class_journal={level},sqlx=warn,reqwest=info").into()
    });

    let json = env::var("JOURNAL_LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(verbose)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.context("initializing logging")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_push_force() {
        let cli = Cli::try_parse_from([
            "class-journal",
            "--remote",
            "memory",
            "--owner",
            "teacher-1",
            "push",
            "--force",
        ])
        .unwrap();

        assert_eq!(cli.remote, RemoteKind::Memory);
        assert_eq!(cli.owner.as_deref(), Some("teacher-1"));
        assert!(matches!(cli.command, Command::Push { force: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["class-journal", "status", "--json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Status { json: true }));
    }

    #[test]
    fn test_drive_remote_flag() {
        let cli = Cli::try_parse_from(["class-journal", "--remote", "drive", "pull"]).unwrap();
        assert_eq!(cli.remote, RemoteKind::Drive);
        assert!(matches!(cli.command, Command::Pull { force: false }));
    }
}
