//! Start command: run the daemon.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Start the merlin daemon.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Optional TOML configuration file; flags override file values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// /health, /alive and /metrics port.
    #[arg(long = "health-port")]
    pub health_port: Option<u16>,

    /// Storage backend to use; supports etcd2 or etcd3.
    #[arg(long = "store-backend")]
    pub store_backend: Option<String>,

    /// Comma delimited list of etcd2 / etcd3 endpoints.
    #[arg(long = "store-endpoints", value_delimiter = ',')]
    pub store_endpoints: Option<Vec<String>>,

    /// Prefix to store state under.
    #[arg(long = "store-prefix")]
    pub store_prefix: Option<String>,

    /// How often to periodically sync ipvs state, in seconds.
    #[arg(long = "reconcile-sync-period")]
    pub reconcile_sync_period: Option<u64>,

    /// If enabled, merlin will reconcile local ipvs with store state.
    #[arg(long)]
    pub reconcile: Option<bool>,

    /// Enable debug logs.
    #[arg(long)]
    pub debug: bool,
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    init_tracing(args.debug);
    if args.debug {
        tracing::debug!("debug logs on");
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_overrides(&ConfigOverrides {
        port: args.port,
        health_port: args.health_port,
        store_backend: args.store_backend,
        store_endpoints: args.store_endpoints,
        store_prefix: args.store_prefix,
        reconcile_sync_period_seconds: args.reconcile_sync_period,
        reconcile: args.reconcile,
        debug: args.debug,
    });

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
