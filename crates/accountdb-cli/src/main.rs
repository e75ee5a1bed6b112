mod commands;
mod report;

use std::path::PathBuf;
use std::time::Duration;

use accountdb_config::{AppConfig, ConfigLoader, LogConfig};
use accountdb_db::AccountStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "accountdb", version, about = "Account database initialization and migrations")]
struct Cli {
    /// Config file (YAML or TOML)
    #[arg(short, long, global = true, env = "ACCOUNTDB_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides config and environment
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Emit reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the base tables if they are missing
    Init,
    /// Apply pending migrations
    Migrate,
    /// Undo one migration. Destroys the data held in the columns it drops
    Revert {
        version: u32,
        /// Skip the interactive confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Show applied and pending migrations
    Status,
    /// Check the email-verification columns and indexes
    Verify,
    /// Engine version and row counts per table
    Health,
    /// Run a SQL script, skipping statements whose objects already exist
    Apply { file: PathBuf },
    /// Store a fresh verification token for a user and print it
    IssueToken { user_id: i64 },
    /// List ids of users whose email is not verified
    Unverified,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    init_tracing(&config.log, cli.log_json);
    debug!("database path: {}", config.database.path.display());

    let store = open_store(&config)?;
    let json = cli.json;

    match cli.command {
        Command::Init => commands::init(&store, json),
        Command::Migrate => commands::migrate(&store, json),
        Command::Revert { version, yes } => commands::revert(&store, &config, version, yes, json),
        Command::Status => commands::status(&store, json),
        Command::Verify => commands::verify(&store, json),
        Command::Health => commands::health(&store, json),
        Command::Apply { file } => commands::apply(&store, &file, json),
        Command::IssueToken { user_id } => commands::issue_token(&store, &config, user_id, json),
        Command::Unverified => commands::unverified(&store, json),
    }
}

fn init_tracing(log: &LogConfig, force_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.json || force_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &AppConfig) -> Result<AccountStore> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    AccountStore::open_with_timeout(path, Duration::from_millis(config.database.busy_timeout_ms))
        .with_context(|| format!("failed to open {}", path.display()))
}
