use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use confluence_engine::config::EngineConfig;
use confluence_engine::persistence::{CachedStore, FileStore};
use confluence_engine::runtime::Runtime;
use confluence_engine::streams::{self, spawn_replay};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON engine config (defaults apply to missing fields)
    #[arg(short, long, env = "ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Candle CSV to replay
    #[arg(long, env = "CANDLES_CSV")]
    candles: PathBuf,

    /// Optional tick CSV merged into the replay
    #[arg(long, env = "TICKS_CSV")]
    ticks: Option<PathBuf>,

    /// Store directory for signals, trades and account state
    #[arg(short, long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Spool file for writes the store rejected
    #[arg(long, env = "SPOOL_PATH")]
    spool: Option<PathBuf>,

    /// Log level for this crate (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("confluence_engine={}", args.log_level).parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(spool) = &args.spool {
        config.persistence.spool_path = Some(spool.clone());
    }
    config.validate()?;

    info!("Starting confluence engine");
    info!("Timeframes: {:?}", config.timeframes);
    info!("Data dir: {}", args.data_dir.display());

    let candles = streams::load_candles(&args.candles)?;
    let ticks = match &args.ticks {
        Some(path) => streams::load_ticks(path)?,
        None => Vec::new(),
    };
    info!("Loaded {} candles, {} ticks", candles.len(), ticks.len());
    let events = streams::merge(candles, ticks);
    let start = events.first().map(|e| e.event_time()).unwrap_or_else(Utc::now);

    let store = FileStore::open(&args.data_dir)
        .await
        .with_context(|| format!("Failed to open store at {:?}", args.data_dir))?;
    let runtime = Runtime::new(config, Arc::new(CachedStore::new(store)))?;

    let emergency = runtime.emergency_stop();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C: engaging emergency stop");
            emergency.engage();
        }
    });

    let (tx, rx) = mpsc::channel(1_024);
    let feeder = spawn_replay(events, tx);
    let summary = runtime.run(rx, start).await?;
    let sent = feeder.await.unwrap_or(0);

    info!("Replayed {} events", sent);
    info!("{}", summary.account.stats_summary());
    if summary.degraded {
        warn!("Store degraded: records remain in the spool");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
