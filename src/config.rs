use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

/// Environment variables prefixed with this override file values,
/// e.g. `SHAREDSTORE__STORE__DEFAULT_PATH`.
pub const ENV_PREFIX: &str = "SHAREDSTORE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub selection: SelectionConfig,
    pub server: ServerConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database selected when a caller has made no explicit choice.
    pub default_path: Option<String>,
    /// Overrides the compiled-in required schema version.
    pub required_version: Option<i64>,
    /// Directory of `V<n>__<name>.sql` files replacing the bundled catalog.
    pub migrations_dir: Option<String>,
    /// Privileged callers migrate stale stores during `select`.
    pub auto_migrate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_path: None,
            required_version: None,
            migrations_dir: None,
            auto_migrate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    /// Kept short so contention reaches the retry policy instead of
    /// stalling inside SQLite.
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout_ms: 30_000,
            busy_timeout_ms: 100,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// JSON file holding each user's last selected store. In-memory when unset.
    pub state_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Grants the admin API privileged (migrating) access.
    pub allow_migrate: bool,
}

impl AppConfig {
    /// Loads a config file (any format the `config` crate understands) and
    /// applies `SHAREDSTORE__*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            bail!("pool.max_connections must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            bail!("retry.max_delay_ms must not be smaller than retry.base_delay_ms");
        }
        if let Some(required) = self.store.required_version {
            if required < 0 {
                bail!("store.required_version must not be negative");
            }
        }
        if let Some(path) = &self.store.default_path {
            if path.trim().is_empty() {
                bail!("store.default_path must not be empty");
            }
        }
        Ok(())
    }
}
