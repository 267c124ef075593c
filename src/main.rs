//! Roundbet daemon: ledger, round keeper and HTTP API in one process.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use roundbet_backend::api::{create_router, AppState};
use roundbet_backend::clock::SystemClock;
use roundbet_backend::config::AppConfig;
use roundbet_backend::logging::{init_tracing, LogFormat};
use roundbet_backend::sync::RoundKeeper;
use roundbet_backend::units::format_price;
use roundbet_backend::PredictionGame;

#[derive(Parser, Debug)]
#[command(name = "roundbet")]
#[command(about = "BTC up/down prediction rounds: keeper and HTTP API")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "ROUNDBET_CONFIG")]
    config: Option<PathBuf>,

    /// Do not run the background round keeper
    #[arg(long)]
    no_keeper: bool,

    /// Do not serve the HTTP API
    #[arg(long)]
    no_api: bool,

    /// Override the API bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the ledger database path
    #[arg(long)]
    db: Option<String>,
}

fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing(LogFormat::from_env());

    let mut config = AppConfig::load(args.config.as_deref())?;
    if args.no_keeper {
        config.keeper.enabled = false;
    }
    if args.no_api {
        config.server.enabled = false;
    }
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }

    info!(
        db_path = %config.storage.db_path,
        round_duration_secs = config.game.round_duration_secs,
        max_price_age_secs = config.game.max_price_age_secs,
        "Roundbet starting"
    );

    // Oracle feeds hold blocking HTTP clients, so the game is built and dropped outside the runtime.
    let game = Arc::new(PredictionGame::from_config(&config, Arc::new(SystemClock))?);

    // The keeper retries genesis on its own schedule when the oracle is down at boot.
    match game.bootstrap() {
        Ok(round) => info!(
            round_id = round.id,
            start_price = %format_price(round.start_price),
            end_time = round.end_time,
            "Current round ready"
        ),
        Err(e) => warn!(error = %e, code = e.code(), "Bootstrap deferred"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(serve(game.clone(), config));
    runtime.shutdown_timeout(Duration::from_secs(5));
    drop(game);
    result
}

async fn serve(game: Arc<PredictionGame>, config: AppConfig) -> Result<()> {
    let mut views = None;
    let keeper_handle = if config.keeper.enabled {
        let keeper = RoundKeeper::new(game.clone(), config.keeper.clone());
        views = Some(keeper.subscribe());
        Some(tokio::spawn(keeper.run()))
    } else {
        info!("Round keeper disabled");
        None
    };

    if config.server.enabled {
        if config.server.admin_token.is_none() {
            info!("API_ADMIN_TOKEN not set, pool withdrawals disabled over HTTP");
        }
        let app = create_router(AppState {
            game,
            views,
            admin_token: config.server.admin_token.clone(),
        });
        let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
        info!("HTTP API listening on {}", config.server.bind_addr);

        tokio::select! {
            res = axum::serve(listener, app) => res.context("Server error")?,
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    } else if let Some(handle) = keeper_handle {
        tokio::select! {
            res = handle => {
                if let Err(e) = res {
                    error!("Round keeper task failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    } else {
        warn!("Both keeper and API disabled, nothing to run");
    }

    Ok(())
}

fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
