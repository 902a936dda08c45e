#![deny(unsafe_code)]
use anyhow::{Context, Result};
use bp_config::load_config;
use bp_daemon::{build_app, build_state, run_codex_tick, run_reconcile_tick};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bp-daemon", version, about = "Local control-plane daemon mediating job producer and authoring host")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8077")]
    bind: String,

    /// Path to a TOML config file. Defaults are used for anything it omits.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose request/response logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("bp_daemon=debug,bp_codexbridge=debug,bp_context=debug,info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(args.config.as_deref()).context("load configuration")?;
    let bind = args.bind.clone();
    let reconcile_interval = Duration::from_secs(config.reconcile_interval_sec);

    let state = build_state(config).await.context("build application state")?;

    tokio::spawn({
        let state = state.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                run_codex_tick(&state).await;
            }
        }
    });

    tokio::spawn({
        let state = state.clone();
        async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            loop {
                ticker.tick().await;
                run_reconcile_tick(&state).await;
            }
        }
    });

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "bp-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
