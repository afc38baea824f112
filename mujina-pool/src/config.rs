//! Configuration management for mujina-pool.
//!
//! Configuration is read from a TOML file. Every section has defaults, so an
//! empty file (or no file at all) yields a pool listening on port 3333 with
//! vardiff enabled. Values are resolved once at startup and shared read-only
//! afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "MUJINA_POOL_CONFIG";

/// Main configuration structure for the pool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pool-wide settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Default ban policy, used by ports without their own
    #[serde(default)]
    pub banning: BanningConfig,

    /// Share persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Listening ports
    #[serde(default = "default_ports")]
    pub ports: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Pool-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Pool identifier, recorded with every share
    pub id: String,

    /// Address the listeners bind to
    pub listen_address: String,

    /// How often the job source is polled
    pub job_poll_interval_ms: u64,

    /// Re-send the current job after this many seconds without a new block
    /// (0 disables)
    pub job_rebroadcast_timeout_secs: u64,

    /// Disconnect clients silent for this many seconds (0 disables)
    pub client_connection_timeout_secs: u64,

    /// Disconnect sockets that send nothing within this many seconds
    pub zombie_grace_secs: u64,

    /// Instance id stamped into extranonce1; random when unset
    pub instance_id: Option<u8>,

    /// Bytes of extranonce1 handed to each connection
    pub extranonce1_size: usize,

    /// Bytes of extranonce2 the miner rolls itself
    pub extranonce2_size: usize,

    /// Jobs retained for share verification since the last clean job
    pub max_active_jobs: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            id: "mujina".into(),
            listen_address: "0.0.0.0".into(),
            job_poll_interval_ms: 1000,
            job_rebroadcast_timeout_secs: 55,
            client_connection_timeout_secs: 600,
            zombie_grace_secs: 10,
            instance_id: None,
            extranonce1_size: 4,
            extranonce2_size: 4,
            max_active_jobs: 16,
        }
    }
}

impl PoolSettings {
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn job_rebroadcast_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.job_rebroadcast_timeout_secs)
    }

    pub fn client_connection_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.client_connection_timeout_secs)
    }

    pub fn zombie_grace(&self) -> Duration {
        Duration::from_secs(self.zombie_grace_secs)
    }
}

/// Ban thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BanningConfig {
    /// Master switch for share-ratio bans
    pub enabled: bool,

    /// Evaluate once more than this many shares were seen from an address
    pub check_threshold: u32,

    /// Ban when the invalid share percentage reaches this value
    pub invalid_percent: f64,

    /// Ban duration in seconds
    pub time_secs: u64,

    /// Ban addresses that send unparseable requests
    pub ban_on_junk_receive: bool,

    /// How often expired bans are purged
    pub purge_interval_secs: u64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_threshold: 50,
            invalid_percent: 50.0,
            time_secs: 600,
            ban_on_junk_receive: true,
            purge_interval_secs: 60,
        }
    }
}

impl BanningConfig {
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.time_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// Share persistence settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON-lines file the daemon's store appends accepted shares to
    pub share_file: PathBuf,

    /// Fallback file for shares the store could not take
    pub recovery_file: PathBuf,

    /// Attempts per share before falling back
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt
    pub retry_base_delay_ms: u64,

    /// Queue depth that triggers a backlog warning
    pub queue_warning_threshold: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            share_file: PathBuf::from("shares.jsonl"),
            recovery_file: PathBuf::from("recovered-shares.txt"),
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            queue_warning_threshold: 1024,
        }
    }
}

impl PersistenceConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Per-port policy: base difficulty plus optional vardiff and ban overrides.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub port: u16,

    /// Display name for logs
    #[serde(default)]
    pub name: Option<String>,

    /// Difficulty assigned to new connections
    pub difficulty: f64,

    #[serde(default)]
    pub vardiff: Option<VarDiffConfig>,

    /// Overrides the pool-wide ban policy for this port
    #[serde(default)]
    pub banning: Option<BanningConfig>,
}

impl EndpointConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.port.to_string())
    }

    /// Ban policy in force on this port.
    pub fn banning_or<'a>(&'a self, global: &'a BanningConfig) -> &'a BanningConfig {
        self.banning.as_ref().unwrap_or(global)
    }
}

/// Vardiff bounds for one port.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VarDiffConfig {
    pub min_diff: f64,

    /// Upper bound; the network difficulty still caps it when known
    #[serde(default)]
    pub max_diff: Option<f64>,

    /// Largest absolute change per retarget
    #[serde(default)]
    pub max_delta: Option<f64>,

    /// Desired seconds between shares
    pub target_time: f64,

    /// Minimum seconds between retargets
    pub retarget_time: f64,

    /// Allowed deviation from target_time before retargeting, in percent
    pub variance_percent: f64,
}

fn default_ports() -> Vec<EndpointConfig> {
    vec![EndpointConfig {
        port: 3333,
        name: Some("default".into()),
        difficulty: 1.0,
        vardiff: Some(VarDiffConfig {
            min_diff: 1.0,
            max_diff: None,
            max_delta: None,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
        }),
        banning: None,
    }]
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from the file named by `MUJINA_POOL_CONFIG`, or
    /// defaults when the variable is unset.
    pub fn load() -> Result<Self> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load_from(Path::new(&path)),
            Err(_) => {
                let config = Self {
                    ports: default_ports(),
                    ..Default::default()
                };
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::Config("no ports configured".into()));
        }
        if self.pool.job_poll_interval_ms == 0 {
            return Err(Error::Config("job_poll_interval_ms must be > 0".into()));
        }
        if self.pool.extranonce1_size == 0 || self.pool.extranonce1_size > 8 {
            return Err(Error::Config("extranonce1_size must be 1..=8".into()));
        }
        if let Some(id) = self.pool.instance_id {
            if id >= 1 << crate::extranonce::INSTANCE_ID_BITS {
                return Err(Error::Config(format!("instance_id {} out of range", id)));
            }
        }

        validate_banning(&self.banning)?;

        let mut seen = HashSet::new();
        for endpoint in &self.ports {
            if !seen.insert(endpoint.port) {
                return Err(Error::Config(format!("duplicate port {}", endpoint.port)));
            }
            if !(endpoint.difficulty > 0.0) {
                return Err(Error::Config(format!(
                    "port {}: difficulty must be positive",
                    endpoint.port
                )));
            }
            if let Some(vardiff) = &endpoint.vardiff {
                validate_vardiff(endpoint.port, vardiff)?;
            }
            if let Some(banning) = &endpoint.banning {
                validate_banning(banning)?;
            }
        }
        Ok(())
    }
}

fn validate_vardiff(port: u16, vardiff: &VarDiffConfig) -> Result<()> {
    let fail = |msg: &str| Err(Error::Config(format!("port {}: vardiff {}", port, msg)));

    if !(vardiff.min_diff > 0.0) {
        return fail("min_diff must be positive");
    }
    if let Some(max) = vardiff.max_diff {
        if max < vardiff.min_diff {
            return fail("max_diff below min_diff");
        }
    }
    if !(vardiff.target_time > 0.0 && vardiff.target_time.is_finite()) {
        return fail("target_time must be positive and finite");
    }
    if !(vardiff.retarget_time >= 0.0 && vardiff.retarget_time.is_finite()) {
        return fail("retarget_time must be non-negative and finite");
    }
    if !(0.0..100.0).contains(&vardiff.variance_percent) {
        return fail("variance_percent must be in 0..100");
    }
    if matches!(vardiff.max_delta, Some(d) if d <= 0.0) {
        return fail("max_delta must be positive");
    }
    Ok(())
}

fn validate_banning(banning: &BanningConfig) -> Result<()> {
    if !(0.0..=100.0).contains(&banning.invalid_percent) {
        return Err(Error::Config("invalid_percent must be in 0..=100".into()));
    }
    Ok(())
}
