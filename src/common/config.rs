use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Tunables for the FTP client and its connection pool.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_pool_cap")]
    pub pool_cap: usize,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_seek_threshold_bytes")]
    pub seek_threshold_bytes: u64,
}

impl ClientConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let cfg: ClientConfig = toml::from_str(&content)?;
        Ok(cfg)
    }

    /// Idle connections older than this are quit by the pool reaper.
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    /// Deadline applied to each FTP operation, including pool leasing.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: default_password(),
            pool_cap: default_pool_cap(),
            idle_ttl_secs: default_idle_ttl_secs(),
            op_timeout_secs: default_op_timeout_secs(),
            seek_threshold_bytes: default_seek_threshold_bytes(),
        }
    }
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_password() -> String {
    "anonymous".to_string()
}

fn default_pool_cap() -> usize {
    8
}

fn default_idle_ttl_secs() -> u64 {
    60
}

fn default_op_timeout_secs() -> u64 {
    60
}

fn default_seek_threshold_bytes() -> u64 {
    128 * 1024
}
