//! `fakio-local`: accepts plain SOCKS5 connections and tunnels them,
//! AES-128-CTR encrypted, to a `fakio-server`.
//!
//! Usage: `fakio-local <config_path>`

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use fakio::config;
use fakio::local::LocalProxy;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "fakio-local".to_string());
    let config_path: PathBuf = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("Usage: {program} <config_path>"))?
        .into();

    let cfg = config::load_client_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let mut proxy = LocalProxy::bind(cfg).context("starting fakio-local")?;
    proxy.run().context("fakio-local event loop failed")?;
    Ok(())
}
