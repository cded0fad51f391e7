use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_max_entries() -> usize {
    1000
}

fn default_client_timeout() -> u64 {
    30
}

fn default_resolve_timeout() -> u64 {
    5
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    30
}

fn default_stream_wait_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    1
}

fn default_max_header_size() -> usize {
    8 * 1024
}

fn default_max_key_length() -> usize {
    4096
}

fn default_stats_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Upper bound on cache directory size; admissions beyond it require an eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    /// Per-chunk deadline for origin reads and for the initial request send.
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    /// How long a caught-up reader sleeps before re-checking entry progress.
    #[serde(default = "default_stream_wait_timeout_ms")]
    pub stream_wait_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    /// Seconds between cache statistics log lines; 0 disables the reporter.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path).required(true));
        builder = builder.add_source(
            Environment::with_prefix("TEECACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn stream_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_wait_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_entries > 0,
            "max_entries must be at least 1 (got {})",
            self.max_entries
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.resolve_timeout > 0,
            "resolve_timeout must be greater than 0 seconds (got {})",
            self.resolve_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.stream_wait_timeout_ms > 0,
            "stream_wait_timeout_ms must be greater than 0 (got {})",
            self.stream_wait_timeout_ms
        );
        ensure!(
            self.shutdown_grace > 0,
            "shutdown_grace must be greater than 0 seconds (got {})",
            self.shutdown_grace
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_key_length > 0,
            "max_key_length must be greater than 0 (got {})",
            self.max_key_length
        );
        Ok(())
    }
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/teecache/teecache.toml"),
        PathBuf::from("teecache.toml"),
    ]
}
