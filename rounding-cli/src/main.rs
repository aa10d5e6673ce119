use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use rounding_sync::store::{ListStoreAdapter, MemoryListBackend};
use rounding_sync::{
    actor, Credentials, Exporter, GraphDriveTarget, GraphListBackend, LocalCache, Principal, RoundingConfig,
    SyncEngine, SyncEvent, SyncListener, TracingAuditSink,
};

/// Clinical rounding list
#[derive(Parser, Debug)]
#[command(name = "rounding")]
#[command(about = "Import, look up and export the clinical rounding list", version)]
struct Cli {
    /// Configuration file (defaults to ./rounding.{toml,yaml,json} when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Signed-in user id
    #[arg(long, global = true, env = "ROUNDING_USER", default_value = "local-user")]
    user: String,

    /// Roles of the signed-in user
    #[arg(
        long = "role",
        global = true,
        env = "ROUNDING_ROLES",
        value_delimiter = ',',
        default_value = "clinician"
    )]
    roles: Vec<String>,

    /// Microsoft Graph access token
    #[arg(long, global = true, env = "ROUNDING_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a rounding spreadsheet exported as CSV
    Import {
        file: PathBuf,
        /// Parse and apply against an empty in-memory store instead of Graph
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the most recent visit for an MRN
    Backfeed { mrn: String },
    /// Print the on-call schedule
    Schedule,
    /// Read or change global settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Upload a workbook to OneDrive
    Export {
        file: PathBuf,
        /// Name to upload under (default: timestamped)
        #[arg(long)]
        name: Option<String>,
    },
    /// Keep a session open and log every change until Ctrl-C
    Watch,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Get { key: Option<String> },
    Set { key: String, value: String },
}

struct LogListener;

impl SyncListener for LogListener {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::PatientsChanged(patients) => info!(count = patients.len(), "Patients updated"),
            SyncEvent::ScheduleChanged(shifts) => info!(count = shifts.len(), "On-call schedule updated"),
            SyncEvent::SettingsChanged(_) => info!("Settings updated"),
            SyncEvent::ModeChanged { mode, cached_at } => match cached_at {
                Some(at) => info!(%mode, cached_at = %at.to_rfc3339(), "Mode changed, showing cached data"),
                None => info!(%mode, "Mode changed"),
            },
        }
    }
}

impl Cli {
    fn principal(&self) -> Principal {
        Principal::new(self.user.clone(), self.roles.iter().map(|r| r.trim().to_lowercase()))
    }

    fn token(&self) -> Result<String> {
        match &self.token {
            Some(token) if !token.trim().is_empty() => Ok(token.clone()),
            _ => bail!("No access token; set ROUNDING_ACCESS_TOKEN or pass --token"),
        }
    }

    fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials::new(self.principal(), self.token()?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = RoundingConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.logging = config.logging.verbose();
    }
    logger_redacted::init_tracing(&config.logging)?;

    let dry_run = matches!(cli.command, Command::Import { dry_run: true, .. });
    let needs_lists = !dry_run && !matches!(cli.command, Command::Export { .. });
    config.validate(needs_lists)?;

    match &cli.command {
        Command::Import { file, dry_run } => import(&cli, &config, file, *dry_run).await,
        Command::Backfeed { mrn } => {
            let engine = connect(&cli, &config).await?;
            let previous = engine.get_previous_visit(mrn).await?;
            println!("{}", serde_json::to_string_pretty(&previous)?);
            Ok(())
        }
        Command::Schedule => {
            let engine = connect(&cli, &config).await?;
            println!("{}", serde_json::to_string_pretty(engine.on_call_schedule())?);
            Ok(())
        }
        Command::Settings { action } => settings(&cli, &config, action).await,
        Command::Export { file, name } => export(&cli, &config, file, name.as_deref()).await,
        Command::Watch => watch(&cli, &config).await,
    }
}

async fn build_engine(cli: &Cli, config: &RoundingConfig) -> Result<SyncEngine> {
    let backend = GraphListBackend::new(&config.graph)?;
    let store = Arc::new(ListStoreAdapter::new(backend, config.retry.policy()));
    let cache = LocalCache::open_sqlite(&config.cache.path).await;
    let mut engine = SyncEngine::new(store.clone(), cache, store);
    if cli.verbose {
        engine.add_listener(Arc::new(LogListener));
    }
    Ok(engine)
}

async fn connect(cli: &Cli, config: &RoundingConfig) -> Result<SyncEngine> {
    let mut engine = build_engine(cli, config).await?;
    engine.start(cli.credentials()?).await?;
    info!(mode = %engine.mode(), "Session started");
    Ok(engine)
}

async fn import(cli: &Cli, config: &RoundingConfig, file: &Path, dry_run: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut engine = if dry_run {
        let store = Arc::new(ListStoreAdapter::new(MemoryListBackend::new(), config.retry.policy()));
        let mut engine = SyncEngine::new(store, LocalCache::disabled(), Arc::new(TracingAuditSink));
        engine.start(Credentials::new(cli.principal(), "dry-run")).await?;
        engine
    } else {
        connect(cli, config).await?
    };

    let report = engine.import_csv(&text).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn settings(cli: &Cli, config: &RoundingConfig, action: &SettingsAction) -> Result<()> {
    let mut engine = connect(cli, config).await?;
    match action {
        SettingsAction::Get { key: Some(key) } => match engine.settings().get(key) {
            Some(value) => println!("{}", value),
            None => bail!("Unknown setting: {}", key),
        },
        SettingsAction::Get { key: None } => {
            println!("{}", serde_json::to_string_pretty(engine.settings())?);
        }
        SettingsAction::Set { key, value } => {
            engine.save_setting(key, value).await?;
            info!(key = %key, "Setting saved");
        }
    }
    Ok(())
}

async fn export(cli: &Cli, config: &RoundingConfig, file: &Path, name: Option<&str>) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let target = GraphDriveTarget::new(&config.graph)?;
    target.set_access_token(SecretString::new(cli.token()?));
    let exporter = Exporter::new(Arc::new(target), Arc::new(TracingAuditSink), config.export.clone());

    let file_name = name.map_or_else(|| Exporter::default_file_name(Utc::now()), str::to_string);
    let principal = cli.principal();
    let outcome = exporter.export(Some(&principal), bytes, &file_name).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn watch(cli: &Cli, config: &RoundingConfig) -> Result<()> {
    let mut engine = build_engine(cli, config).await?;
    if !cli.verbose {
        engine.add_listener(Arc::new(LogListener));
    }
    let (handle, task) = actor::spawn(engine, config.sync.poll_interval());
    handle.start(cli.credentials()?).await?;

    let snapshot = handle.snapshot().await?;
    info!(
        mode = %snapshot.mode,
        patients = snapshot.patients.len(),
        poll_secs = config.sync.poll_interval_secs,
        "Watching for changes, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    handle.shutdown().await;
    task.await.context("Sync task panicked")?;
    Ok(())
}
