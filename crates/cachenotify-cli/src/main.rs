use anyhow::{Context, Result};
use cachenotify_core::{EngineConfig, JsonlEventStore};
use cachenotify_engine::{
    Collaborators, ControlFile, FileLivenessSink, JsonFileCheckpointStore,
    LoggingInvalidationService, NotificationEngine, UnprocessedOrderReport,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, Registry};

#[derive(Parser)]
#[command(name = "cachenotify")]
#[command(about = "Polls change-notification tables and invalidates caches", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding default.toml, <env>.toml and local.toml
    #[arg(long, global = true, env = "CACHENOTIFY_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Environment layer to apply on top of the defaults
    #[arg(long, global = true, env = "CACHENOTIFY_ENV", default_value = "production")]
    env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Directory of <TABLE>.jsonl notification tables
        #[arg(long, env = "CACHENOTIFY_EVENTS_DIR")]
        events_dir: PathBuf,
    },

    /// Print the merged configuration
    CheckConfig {
        /// Print the JSON schema instead
        #[arg(long)]
        schema: bool,
    },

    /// List persisted checkpoints
    Checkpoints {
        /// Checkpoint directory; defaults to resync.checkpoint_dir
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cachenotify=info"));
    let subscriber = Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match &cli.command {
        Commands::CheckConfig { schema: true } => {
            let schema = schemars::schema_for!(EngineConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::CheckConfig { schema: false } => {
            let config = load_config(&cli)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Checkpoints { dir } => {
            let config = load_config(&cli)?;
            let dir = dir
                .clone()
                .or_else(|| config.resync.checkpoint_dir.clone())
                .context("no checkpoint directory given or configured")?;
            let store = JsonFileCheckpointStore::new(dir, config.checkpoint_max_age());
            let saved = store.list().context("listing checkpoints")?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
            Ok(())
        }
        Commands::Run { events_dir } => {
            let config = load_config(&cli)?;
            run(config, events_dir.clone()).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    EngineConfig::load_from_sources(&cli.config_dir, &cli.env).with_context(|| {
        format!(
            "loading configuration from {} (env {})",
            cli.config_dir.display(),
            cli.env
        )
    })
}

async fn run(mut config: EngineConfig, events_dir: PathBuf) -> Result<()> {
    // Drawn once here so the checkpoint age limit and the engine agree on it.
    config.resolve_processing_delay()?;
    let store = Arc::new(JsonlEventStore::new(events_dir));
    let service = Arc::new(LoggingInvalidationService);
    let mut deps = Collaborators::new(store, service);

    // Held for the lifetime of the engine; dropping it stops the reloads.
    let mut _control_watcher = None;
    if let Some(path) = &config.control.file {
        let control = Arc::new(ControlFile::load(path));
        match control.spawn_watcher() {
            Ok(watcher) => _control_watcher = Some(watcher),
            Err(e) => warn!(error = %e, "control file will not be reloaded"),
        }
        deps = deps.with_control(control);
    }
    if let Some(path) = &config.liveness.alive_file {
        deps = deps.with_liveness(Arc::new(FileLivenessSink::new(path)));
    }
    if let Some(dir) = &config.resync.checkpoint_dir {
        deps = deps.with_checkpoints(Arc::new(JsonFileCheckpointStore::new(
            dir,
            config.checkpoint_max_age(),
        )));
    }
    if let Some(path) = &config.recovery.report_file {
        deps = deps.with_report(Arc::new(UnprocessedOrderReport::new(path)));
    }

    let engine = NotificationEngine::new(config, deps)?;
    let handle = engine.spawn()?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupt received, shutting down");

    let report = handle.shutdown().await;
    if report.failed > 0 || report.timed_out > 0 {
        anyhow::bail!(
            "{} task(s) failed and {} timed out during shutdown",
            report.failed,
            report.timed_out
        );
    }
    Ok(())
}
