use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liqhunter::{Config, Credentials, Engine};

/// Exit codes promised to operators.
const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_AUTH_FAILED: u8 = 3;
const EXIT_HARD_STOP: u8 = 4;

#[derive(Debug, Parser)]
#[command(name = "liqhunter", about = "Liquidation-cascade counter-trading engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the database path from the config.
    #[arg(long)]
    db: Option<String>,

    /// Force simulate-only mode regardless of config.
    #[arg(long)]
    simulate: bool,

    /// Log filter (overrides RUST_LOG), e.g. "info,liqhunter=debug".
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();

    let filter = args
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env().add_directive("info".parse().unwrap()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "failed to load config");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    if let Some(db) = args.db {
        cfg.database_path = db;
    }
    if args.simulate {
        cfg.simulate_only = true;
    }
    if let Err(violations) = cfg.validate() {
        for v in &violations {
            error!("config: {v}");
        }
        return ExitCode::from(EXIT_CONFIG_INVALID);
    }

    let creds = Credentials::from_env();
    if !cfg.simulate_only && creds.is_none() {
        error!("live mode requires LIQHUNTER_API_KEY / LIQHUNTER_API_SECRET");
        return ExitCode::from(EXIT_AUTH_FAILED);
    }

    info!(
        symbols = cfg.symbols.len(),
        simulate_only = cfg.simulate_only,
        hedge_mode = cfg.hedge_mode,
        "starting engine"
    );

    let engine = match Engine::start(cfg, creds).await {
        Ok(engine) => engine,
        Err(e) => {
            let chain = format!("{e:#}");
            error!(error = %chain, "engine startup failed");
            if chain.contains("authentication failed") {
                return ExitCode::from(EXIT_AUTH_FAILED);
            }
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "signal listener failed, shutting down"),
    }

    if engine.shutdown().await {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_HARD_STOP)
    }
}
