use serde::Deserialize;
use std::time::Duration;

/// Repair scan strategy (spec.md §4.7.A, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    PerTorrent,
    PerFile,
}

impl Default for RepairStrategy {
    fn default() -> Self {
        RepairStrategy::PerFile
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 220,
            burst: 50,
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

impl RateLimitConfig {
    /// Clamp the configured rate to the documented cap of 250 req/min (spec.md §6).
    pub fn effective_rate(&self) -> u32 {
        self.requests_per_minute.min(250)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    pub auto_fix: bool,
    pub auto_start: bool,
    pub scan_interval_hours: u64,
    pub strategy: RepairStrategy,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_fix: true,
            auto_start: true,
            scan_interval_hours: 48,
            strategy: RepairStrategy::PerFile,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { interval_seconds: 15 }
    }
}

impl RefreshConfig {
    /// spec.md §6: `refresh.intervalSeconds` (15, min 10).
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(10))
    }
}

/// All configuration keys spec.md §6 enumerates, plus the ambient knobs (store path,
/// log filter) a real crate needs but that spec.md's Non-goals never exclude.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub additional_api_keys: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub repair: RepairConfig,
    pub refresh: RefreshConfig,
    pub retain_folder_extension: bool,
    /// (ADDED) Path to the redb database file backing the Store.
    pub store_path: String,
    /// (ADDED) tracing-subscriber env-filter directive, e.g. "info".
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            additional_api_keys: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            repair: RepairConfig::default(),
            refresh: RefreshConfig::default(),
            retain_folder_extension: false,
            store_path: "debridcache.redb".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Build from environment variables, mirroring the teacher's `main.rs` pattern of
    /// `dotenvy::dotenv()` + `std::env::var` with typed fallbacks, but validating up
    /// front (spec.md §7 "Fatal configuration").
    pub fn from_env() -> crate::error::Result<Self> {
        dotenvy::dotenv().ok();

        let api_key = std::env::var("DEBRID_API_KEY")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if api_key.is_empty() {
            return Err(crate::error::CoreError::Config(
                "DEBRID_API_KEY must be set".to_string(),
            ));
        }

        let additional_api_keys = std::env::var("DEBRID_ADDITIONAL_API_KEYS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        fn env_u32(key: &str, default: u32) -> u32 {
            std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
        }
        fn env_u64(key: &str, default: u64) -> u64 {
            std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
        }
        fn env_bool(key: &str, default: bool) -> bool {
            std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
        }

        let rate_limit = RateLimitConfig {
            requests_per_minute: env_u32("RATE_LIMIT_REQUESTS_PER_MINUTE", 220),
            burst: env_u32("RATE_LIMIT_BURST", 50),
            max_retries: env_u32("RATE_LIMIT_MAX_RETRIES", 5),
            base_backoff_ms: env_u64("RATE_LIMIT_BASE_BACKOFF_MS", 500),
            max_backoff_ms: env_u64("RATE_LIMIT_MAX_BACKOFF_MS", 8000),
        };

        let strategy = match std::env::var("REPAIR_STRATEGY").ok().as_deref() {
            Some("per_torrent") => RepairStrategy::PerTorrent,
            _ => RepairStrategy::PerFile,
        };
        let repair = RepairConfig {
            enabled: env_bool("REPAIR_ENABLED", true),
            auto_fix: env_bool("REPAIR_AUTO_FIX", true),
            auto_start: env_bool("REPAIR_AUTO_START", true),
            scan_interval_hours: env_u64("REPAIR_SCAN_INTERVAL_HOURS", 48),
            strategy,
        };

        let refresh = RefreshConfig {
            interval_seconds: env_u64("REFRESH_INTERVAL_SECONDS", 15),
        };

        Ok(Self {
            api_key,
            additional_api_keys,
            rate_limit,
            repair,
            refresh,
            retain_folder_extension: env_bool("RETAIN_FOLDER_EXTENSION", false),
            store_path: std::env::var("STORE_PATH").unwrap_or_else(|_| "debridcache.redb".to_string()),
            log_filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_interval_has_a_10s_floor() {
        let cfg = RefreshConfig { interval_seconds: 3 };
        assert_eq!(cfg.effective_interval(), Duration::from_secs(10));
        let cfg = RefreshConfig { interval_seconds: 20 };
        assert_eq!(cfg.effective_interval(), Duration::from_secs(20));
    }

    #[test]
    fn rate_limit_is_capped_at_250() {
        let cfg = RateLimitConfig { requests_per_minute: 1000, ..Default::default() };
        assert_eq!(cfg.effective_rate(), 250);
    }

    #[test]
    fn repair_strategy_defaults_to_per_file() {
        assert_eq!(RepairConfig::default().strategy, RepairStrategy::PerFile);
    }
}
