use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::AppError;
use crate::pool::PoolConfig;
use crate::registry::RegistryConfig;
use crate::search::SearchConfig;

/// Runtime configuration for a [`ResolverHub`](crate::hub::ResolverHub).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArachneConfig {
    /// Root for `plugins/` and `cache/`.
    pub data_dir: PathBuf,
    pub memory_budget_bytes: u64,
    /// TTL for home, category and detail results.
    pub listing_ttl: Duration,
    /// TTL for search results, per resolver and aggregated.
    pub search_ttl: Duration,
    pub sweep_interval: Duration,
    pub pool_core_size: usize,
    pub pool_max_size: usize,
    pub acquire_timeout: Duration,
    /// Idle engines above the core size are destroyed after this long.
    pub engine_idle_timeout: Duration,
    pub search_concurrency: usize,
    pub call_timeout: Duration,
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    pub max_package_bytes: u64,
    pub reject_warnings: bool,
    pub allow_capability_regression: bool,
}

impl Default for ArachneConfig {
    fn default() -> Self {
        let search = SearchConfig::default();
        let pool = PoolConfig::default();
        Self {
            data_dir: PathBuf::from("arachne-data"),
            memory_budget_bytes: 64 * MIB,
            listing_ttl: Duration::from_secs(60 * 60),
            search_ttl: search.result_ttl,
            sweep_interval: Duration::from_secs(30 * 60),
            pool_core_size: pool.core_size,
            pool_max_size: pool.max_size,
            acquire_timeout: Duration::from_secs(5),
            engine_idle_timeout: Duration::from_secs(5 * 60),
            search_concurrency: search.max_concurrency,
            call_timeout: search.per_call_timeout,
            retry_count: search.retry_count,
            retry_base_delay: search.retry_base_delay,
            max_package_bytes: 16 * MIB,
            reject_warnings: false,
            allow_capability_regression: false,
        }
    }
}

const MIB: u64 = 1024 * 1024;

impl ArachneConfig {
    /// Load from `ARACHNE_*` environment variables; unset ones keep their
    /// defaults.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let config = Self {
            data_dir: env
                .raw("ARACHNE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            memory_budget_bytes: env
                .positive::<u64>("ARACHNE_CACHE_MEMORY_MB")?
                .map_or(defaults.memory_budget_bytes, |mb| mb * MIB),
            listing_ttl: env
                .seconds("ARACHNE_CACHE_TTL_SECS")?
                .unwrap_or(defaults.listing_ttl),
            search_ttl: env
                .seconds("ARACHNE_SEARCH_TTL_SECS")?
                .unwrap_or(defaults.search_ttl),
            sweep_interval: env
                .seconds("ARACHNE_CACHE_SWEEP_SECS")?
                .unwrap_or(defaults.sweep_interval),
            pool_core_size: env
                .number("ARACHNE_POOL_CORE")?
                .unwrap_or(defaults.pool_core_size),
            pool_max_size: env
                .positive("ARACHNE_POOL_MAX")?
                .unwrap_or(defaults.pool_max_size),
            acquire_timeout: env
                .millis("ARACHNE_POOL_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.acquire_timeout),
            engine_idle_timeout: env
                .seconds("ARACHNE_ENGINE_IDLE_SECS")?
                .unwrap_or(defaults.engine_idle_timeout),
            search_concurrency: env
                .positive("ARACHNE_SEARCH_CONCURRENCY")?
                .unwrap_or(defaults.search_concurrency),
            call_timeout: env
                .millis("ARACHNE_SEARCH_TIMEOUT_MS")?
                .unwrap_or(defaults.call_timeout),
            retry_count: env
                .number("ARACHNE_SEARCH_RETRIES")?
                .unwrap_or(defaults.retry_count),
            retry_base_delay: env
                .number::<u64>("ARACHNE_RETRY_BASE_DELAY_MS")?
                .map_or(defaults.retry_base_delay, Duration::from_millis),
            max_package_bytes: env
                .positive::<u64>("ARACHNE_MAX_PACKAGE_MB")?
                .map_or(defaults.max_package_bytes, |mb| mb * MIB),
            reject_warnings: env
                .flag("ARACHNE_SCAN_STRICT")?
                .unwrap_or(defaults.reject_warnings),
            allow_capability_regression: env
                .flag("ARACHNE_ALLOW_CAPABILITY_REGRESSION")?
                .unwrap_or(defaults.allow_capability_regression),
        };

        if config.pool_core_size > config.pool_max_size {
            return Err(AppError::ConfigError(format!(
                "ARACHNE_POOL_CORE ({}) must not exceed ARACHNE_POOL_MAX ({})",
                config.pool_core_size, config.pool_max_size
            )));
        }
        Ok(config)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.data_dir.join("plugins")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: self.listing_ttl,
            sweep_interval: self.sweep_interval,
            ..CacheConfig::new(self.cache_dir()).with_memory_budget(self.memory_budget_bytes)
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_package_bytes: self.max_package_bytes,
            reject_warnings: self.reject_warnings,
            allow_capability_regression: self.allow_capability_regression,
            ..RegistryConfig::new(self.plugin_dir())
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            core_size: self.pool_core_size,
            max_size: self.pool_max_size,
        }
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            max_concurrency: self.search_concurrency,
            per_call_timeout: self.call_timeout,
            retry_count: self.retry_count,
            retry_base_delay: self.retry_base_delay,
            result_ttl: self.search_ttl,
            ..SearchConfig::default()
        }
    }
}

/// Typed access to configuration variables.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T: FromStr>(&self, name: &str) -> Result<Option<T>, AppError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        raw.parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {name} '{raw}': must be a non-negative integer"
            ))
        })
    }

    fn positive<T: FromStr + PartialEq + Default>(&self, name: &str) -> Result<Option<T>, AppError> {
        match self.number::<T>(name)? {
            Some(value) if value == T::default() => Err(AppError::ConfigError(format!(
                "{name} must be at least 1"
            ))),
            other => Ok(other),
        }
    }

    fn seconds(&self, name: &str) -> Result<Option<Duration>, AppError> {
        Ok(self.positive::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, AppError> {
        Ok(self.positive::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, AppError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AppError::ConfigError(format!(
                "Invalid {name} '{raw}': expected true or false"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ArachneConfig, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ArachneConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, ArachneConfig::default());
        assert_eq!(config.pool_config(), PoolConfig::default());
        assert_eq!(config.search_config(), SearchConfig::default());
        assert_eq!(config.cache_config().memory_budget_bytes, 64 * MIB);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = load(&[
            ("ARACHNE_DATA_DIR", "/var/lib/arachne"),
            ("ARACHNE_CACHE_MEMORY_MB", "8"),
            ("ARACHNE_POOL_CORE", "0"),
            ("ARACHNE_POOL_MAX", "3"),
            ("ARACHNE_SEARCH_TIMEOUT_MS", "2500"),
            ("ARACHNE_SEARCH_RETRIES", "0"),
            ("ARACHNE_SCAN_STRICT", "yes"),
        ])
        .unwrap();

        assert_eq!(config.plugin_dir(), PathBuf::from("/var/lib/arachne/plugins"));
        assert_eq!(config.cache_dir(), PathBuf::from("/var/lib/arachne/cache"));
        assert_eq!(config.memory_budget_bytes, 8 * MIB);
        assert_eq!(config.pool_core_size, 0);
        assert_eq!(config.pool_max_size, 3);
        assert_eq!(config.search_config().per_call_timeout, Duration::from_millis(2500));
        assert_eq!(config.search_config().retry_count, 0);
        assert!(config.registry_config().reject_warnings);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = load(&[("ARACHNE_POOL_MAX", "  ")]).unwrap();
        assert_eq!(config.pool_max_size, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for vars in [
            [("ARACHNE_POOL_MAX", "0")],
            [("ARACHNE_POOL_MAX", "many")],
            [("ARACHNE_SEARCH_TIMEOUT_MS", "-5")],
            [("ARACHNE_SCAN_STRICT", "maybe")],
            [("ARACHNE_POOL_CORE", "9")],
        ] {
            let err = load(&vars).unwrap_err();
            assert!(matches!(err, AppError::ConfigError(_)), "{vars:?}");
        }
    }
}
