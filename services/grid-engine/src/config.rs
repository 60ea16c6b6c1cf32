//! Worker configuration
//!
//! Sources, lowest precedence first:
//! 1. serde defaults
//! 2. the file named by `GRID_ENGINE_CONFIG` (YAML or TOML), if set
//! 3. `GRID_ENGINE__*` environment variables, `__` separating sections
//!    (e.g. `GRID_ENGINE__WORKER__INTERVAL_MS=500`)

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::BackoffPolicy;

pub const CONFIG_PATH_ENV: &str = "GRID_ENGINE_CONFIG";
pub const ENV_PREFIX: &str = "GRID_ENGINE";

/// Reconciliation loop tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Delay between ticks
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Bots evaluated per tick
    #[serde(default = "default_max_bots_per_tick")]
    pub max_bots_per_tick: usize,
    /// Executors kept alive in the factory cache
    #[serde(default = "default_provider_cache_max_size")]
    pub provider_cache_max_size: usize,
    /// Bots evaluated in parallel within a tick
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on any single exchange or market-data call
    #[serde(default = "default_exchange_call_timeout_ms")]
    pub exchange_call_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn exchange_call_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_call_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_bots_per_tick: default_max_bots_per_tick(),
            provider_cache_max_size: default_provider_cache_max_size(),
            concurrency: default_concurrency(),
            exchange_call_timeout_ms: default_exchange_call_timeout_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_max_bots_per_tick() -> usize {
    100
}

fn default_provider_cache_max_size() -> usize {
    256
}

fn default_concurrency() -> usize {
    8
}

fn default_exchange_call_timeout_ms() -> u64 {
    10_000
}

/// Credential encryption
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Hex AES-256 key. Falls back to `SECRETS_ENCRYPTION_KEY` when unset.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

/// Live exchange gateway and price feed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Order gateway; live accounts cannot trade without it
    #[serde(default)]
    pub base_url: Option<String>,
    /// Price feed; the paper exchange serves prices when unset
    #[serde(default)]
    pub price_url: Option<String>,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            price_url: None,
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

fn default_gateway_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: BackoffPolicy,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Settings {
    /// Load from `GRID_ENGINE_CONFIG` (if set) and the environment
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let w = &self.worker;
        if w.interval_ms == 0 {
            anyhow::bail!("worker.interval_ms must be positive");
        }
        if w.max_bots_per_tick == 0 || w.concurrency == 0 || w.provider_cache_max_size == 0 {
            anyhow::bail!("worker limits must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_ms > self.retry.max_ms {
            anyhow::bail!("retry.base_ms exceeds retry.max_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.worker.max_bots_per_tick, 100);
        assert_eq!(settings.worker.interval(), Duration::from_secs(1));
        assert_eq!(settings.retry.max_attempts, 5);
        assert!(settings.gateway.base_url.is_none());
        settings.validate().unwrap();
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "worker:\n  interval_ms: 250\n  provider_cache_max_size: 4\nretry:\n  base_ms: 10\n  max_ms: 100\ngateway:\n  base_url: http://gw.local"
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.worker.interval_ms, 250);
        assert_eq!(settings.worker.provider_cache_max_size, 4);
        assert_eq!(settings.worker.max_bots_per_tick, 100);
        assert_eq!(settings.retry.base_ms, 10);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.gateway.base_url.as_deref(), Some("http://gw.local"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[retry]\nbase_ms = 5000\nmax_ms = 10").unwrap();
        assert!(Settings::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load_from(Some(Path::new("/nonexistent/grid.yaml"))).is_err());
    }
}
