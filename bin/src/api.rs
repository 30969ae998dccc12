//! # ofcir-api
//!
//! Serves the lease endpoints over the shared store.
#![allow(clippy::cognitive_complexity)]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use ofcir_api::{OfcirApi, Tokens};
use ofcir_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};
use ofcir_store::{sqlite::SqliteDb, Store};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(author, name = "ofcir-api", bin_name = "ofcir-api", about, long_about = None)]
struct Config {
    #[clap(flatten)]
    common: cli::Config,
    /// Port to serve the lease api on
    #[clap(short, long, env, value_parser, default_value_t = cli::DEFAULT_API_PORT)]
    port: u16,
    /// Path to the YAML file binding tokens to pool lists
    #[clap(long, env, value_parser)]
    tokens_path: Option<PathBuf>,
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
    builder.thread_name(&config.common.thread_name).enable_all();
    if let Some(num) = config.common.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build().context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let db = SqliteDb::new(&config.common.store)
            .await
            .with_context(|| format!("failed to open store {}", config.common.store))?;
        let store = Arc::new(Store::new(db));

        let tokens = match &config.tokens_path {
            Some(path) => Tokens::load(path)?,
            None => {
                warn!("no tokens file configured, every request will be unauthorized");
                Tokens::default()
            }
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let api = OfcirApi::new(addr, store, config.common.namespace.clone(), tokens);

        let token = CancellationToken::new();
        let handle = api.start(token.clone());
        info!(%addr, "lease api started");

        shutdown_signal().await?;
        info!("caught shutdown signal handler");
        token.cancel();
        handle.await.context("api task panicked")?;
        Ok::<_, anyhow::Error>(())
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
