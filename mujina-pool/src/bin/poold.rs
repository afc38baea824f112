//! Pool daemon.
//!
//! Usage:
//!
//! ```text
//! mujina-poold [CONFIG]
//! mujina-poold --recover-shares <FILE> [CONFIG]
//! ```
//!
//! Without a config path, `MUJINA_POOL_CONFIG` is consulted, then defaults.
//! This build serves synthetic work from a local job source; set
//! `MUJINA_POOL_BLOCK_SECS` to change how often its chain advances.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use mujina_pool::config::{Config, CONFIG_ENV_VAR};
use mujina_pool::job_source::DummySource;
use mujina_pool::persistence::{recover_shares, JsonLinesStore, RecoveryFile};
use mujina_pool::pool::{Collaborators, Pool};
use mujina_pool::tracing::{self, prelude::*};
use mujina_pool::validation::{PermissiveAddressValidator, PermissiveShareValidator};

const DEFAULT_BLOCK_SECS: u64 = 600;

/// Stratum mining pool daemon.
#[derive(Debug, Parser)]
#[command(name = "mujina-poold", version, about)]
struct Args {
    /// Configuration file; defaults apply when absent
    #[arg(env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Import shares from a recovery file into the share store, then exit
    #[arg(long = "recover-shares", value_name = "FILE")]
    recover: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

fn block_interval() -> Duration {
    let secs = env::var("MUJINA_POOL_BLOCK_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_SECS);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    tracing::init_journald_or_stdout(&config.logging.level);

    let store = Arc::new(
        JsonLinesStore::open(&config.persistence.share_file)
            .await
            .with_context(|| format!("opening {}", config.persistence.share_file.display()))?,
    );

    if let Some(file) = args.recover {
        let report = recover_shares(&file, store.as_ref()).await?;
        info!(imported = report.imported, failed = report.failed, "Recovery complete.");
        return Ok(());
    }

    let collaborators = Collaborators {
        source: Arc::new(DummySource::new(1, 1_000_000.0, Some(block_interval()))),
        address_validator: Arc::new(PermissiveAddressValidator),
        share_validator: Arc::new(PermissiveShareValidator::new(config.pool.extranonce2_size)),
        store,
        fallback: Arc::new(RecoveryFile::new(&config.persistence.recovery_file)),
    };

    let running = CancellationToken::new();
    let pool = tokio::spawn(Pool::new(config, collaborators).run(running.clone()));
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    pool.await??;
    info!("Exiting.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_recover_shares_with_config() {
        let args =
            Args::try_parse_from(["mujina-poold", "--recover-shares", "lost.txt", "pool.toml"])
                .unwrap();
        assert_eq!(args.recover, Some(PathBuf::from("lost.txt")));
        assert_eq!(args.config, Some(PathBuf::from("pool.toml")));
    }

    #[test]
    fn test_recover_shares_needs_file() {
        assert!(Args::try_parse_from(["mujina-poold", "--recover-shares"]).is_err());
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(Args::try_parse_from(["mujina-poold", "--bogus"]).is_err());
    }
}
