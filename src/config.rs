//! Command line and environment configuration for `serve`.

use crate::docker::DEFAULT_DOCKER_HOST;
use crate::keystore::DEFAULT_KEY_LEN;
use crate::runtime::ResourceLimits;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Shortest key the cookie signer accepts.
pub const MIN_KEY_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--key-length must be at least {MIN_KEY_LEN} bytes, got {0}")]
    KeyTooShort(usize),
    #[error("--{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("--{0} must not be negative")]
    Negative(&'static str),
}

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    /// Port to listen on
    #[arg(long, env = "COMPILER_RPC_PORT", default_value = "8080")]
    pub port: u16,

    /// File storing session authentication keys
    #[arg(long, env = "COMPILER_RPC_AUTH_FILE", default_value = "auth.keys")]
    pub auth_file: PathBuf,

    /// Append a fresh signing key before starting
    #[arg(long)]
    pub rotate_keys: bool,

    /// Length in bytes of generated keys
    #[arg(long, default_value_t = DEFAULT_KEY_LEN)]
    pub key_length: usize,

    /// Container engine endpoint
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    pub docker_host: String,

    /// Directory with static assets (style.css, lang.js)
    #[arg(long, env = "COMPILER_RPC_APP_DIR", default_value = "app")]
    pub app_dir: PathBuf,

    /// Per-request deadline in seconds
    #[arg(long, default_value = "60")]
    pub request_timeout: u64,

    /// Sandbox CPU share weight
    #[arg(long, default_value = "256")]
    pub cpu_shares: i64,

    /// Sandbox memory ceiling in MiB
    #[arg(long, default_value = "64")]
    pub memory_mb: i64,

    /// Sandbox CPU time per 100ms period, in microseconds
    #[arg(long, default_value = "50000")]
    pub cpu_quota_us: i64,

    /// Sandbox writable layer quota in MiB, 0 to leave it to the engine.
    /// Needs a storage driver that supports `size` storage options.
    #[arg(long, default_value = "0")]
    pub disk_quota_mb: i64,
}

impl ServeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_length < MIN_KEY_LEN {
            return Err(ConfigError::KeyTooShort(self.key_length));
        }
        let positive = [
            ("request-timeout", self.request_timeout as i64),
            ("cpu-shares", self.cpu_shares),
            ("memory-mb", self.memory_mb),
            ("cpu-quota-us", self.cpu_quota_us),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v <= 0) {
            return Err(ConfigError::ZeroValue(name));
        }
        if self.disk_quota_mb < 0 {
            return Err(ConfigError::Negative("disk-quota-mb"));
        }
        Ok(())
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_shares: self.cpu_shares,
            memory: self.memory_mb * 1024 * 1024,
            cpu_quota: self.cpu_quota_us,
            disk_quota: self.disk_quota_mb * 1024 * 1024,
            ..ResourceLimits::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
