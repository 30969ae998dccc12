//! # ofcir-manager
//!
//! Runs the pool sizer and the resource FSM against the shared store.
#![allow(clippy::cognitive_complexity)]
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use fsm::{FsmDelays, PoolSecrets, ResourceFsm, ResourceKeys};
use ofcir_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal},
    tracing::*,
    Controller, Manager,
};
use ofcir_store::{sqlite::SqliteDb, Store};
use sizer::{PoolKeys, PoolSizer, SizerDelays};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(author, name = "ofcir-manager", bin_name = "ofcir-manager", about, long_about = None)]
struct Config {
    #[clap(flatten)]
    common: cli::Config,
    /// Path to the YAML file with per-pool provider secrets
    #[clap(long, env, value_parser)]
    secrets_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = Config::parse();
    let trace_config = trace::Config::parse(&config.common.ofcir_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.common.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.common.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build().context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let db = SqliteDb::new(&config.common.store)
            .await
            .with_context(|| format!("failed to open store {}", config.common.store))?;
        let store = Arc::new(Store::new(db));

        let secrets = match &config.secrets_path {
            Some(path) => PoolSecrets::load(path)?,
            None => PoolSecrets::default(),
        };

        let namespace = config.common.namespace.clone();
        let resync = config.common.resync();

        let mut manager = Manager::new();
        manager.register(
            Controller::new(
                "pool",
                store.watch_pools(),
                PoolKeys::new(store.clone(), &namespace),
                PoolSizer::new(store.clone(), SizerDelays::default()),
            )
            .resync(resync),
        );
        manager.register(
            Controller::new(
                "resource",
                store.watch_resources(),
                ResourceKeys::new(store.clone(), &namespace),
                ResourceFsm::new(store.clone(), secrets, FsmDelays::default()),
            )
            .resync(resync),
        );

        info!(store = %config.common.store, %namespace, "starting reconciler manager");
        manager.start(shutdown_signal()).await
    })?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("failed to listen for ctrl-c"),
        _ = sigterm.recv() => Ok(()),
    }
}
