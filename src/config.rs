//! Configuration management for Windowguard.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WindowguardError};
use crate::ratelimit::{FailurePolicy, DEFAULT_MAX, DEFAULT_WINDOW_MS};

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `WINDOWGUARD__CACHE__URL`.
pub const ENV_PREFIX: &str = "WINDOWGUARD";

/// Main configuration for Windowguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowguardConfig {
    /// Distributed cache backend
    #[serde(default)]
    pub cache: CacheConfig,

    /// Relational backend
    #[serde(default)]
    pub relational: RelationalConfig,

    /// Tier selection and limits
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Cache backend configuration.
///
/// The cache tier is only eligible when both `url` and `token` are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis endpoint, e.g. `rediss://cache.internal:6379`
    #[serde(default)]
    pub url: Option<String>,

    /// Credential presented to the store
    #[serde(default)]
    pub token: Option<String>,

    /// Prefix prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl CacheConfig {
    /// Endpoint and credential, if both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => Some((url, token)),
            _ => None,
        }
    }
}

fn default_key_prefix() -> String {
    "windowguard".to_string()
}

/// Relational backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// Database URL, e.g. `sqlite:///var/lib/app/limits.db`
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits on a locked database before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Create the counter table at startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
            auto_migrate: true,
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_max")]
    pub default_max: u64,

    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,

    /// Bound on a single cache or relational round trip
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Decision when every tier fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Keep the in-process tier as the last fallback
    #[serde(default = "default_true")]
    pub in_process_fallback: bool,

    /// Interval between sweeps of the in-process tier
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_max: default_max(),
            default_window_ms: default_window_ms(),
            call_timeout_ms: default_call_timeout(),
            failure_policy: FailurePolicy::default(),
            in_process_fallback: true,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max() -> u64 {
    DEFAULT_MAX
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_call_timeout() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    300
}

impl WindowguardConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `WINDOWGUARD__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WindowguardError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load_yaml(dir: &TempDir, yaml: &str) -> Result<WindowguardConfig> {
        let path = dir.path().join("windowguard.yaml");
        std::fs::write(&path, yaml).unwrap();
        WindowguardConfig::load(Some(path.to_str().unwrap()))
    }

    #[test]
    fn test_defaults() {
        let config = WindowguardConfig::default();
        assert_eq!(config.limiter.default_max, 10);
        assert_eq!(config.limiter.default_window_ms, 60_000);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Open);
        assert!(config.limiter.in_process_fallback);
        assert_eq!(config.limiter.sweep_interval_secs, 300);
        assert_eq!(config.cache.key_prefix, "windowguard");
        assert!(config.cache.credentials().is_none());
    }

    #[test]
    fn test_load_yaml_file() {
        let yaml = r#"
cache:
  url: redis://127.0.0.1:6379
  token: secret
relational:
  url: sqlite://limits.db
limiter:
  failure_policy: closed
  call_timeout_ms: 250
"#;
        let dir = TempDir::new().unwrap();
        let config = load_yaml(&dir, yaml).unwrap();
        assert_eq!(
            config.cache.credentials(),
            Some(("redis://127.0.0.1:6379", "secret"))
        );
        assert_eq!(config.relational.url.as_deref(), Some("sqlite://limits.db"));
        assert_eq!(config.relational.max_connections, 5);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.limiter.call_timeout_ms, 250);
        assert_eq!(config.limiter.default_max, 10);
    }

    #[test]
    fn test_cache_needs_both_url_and_token() {
        let mut cache = CacheConfig {
            url: Some("redis://127.0.0.1:6379".to_string()),
            ..CacheConfig::default()
        };
        assert!(cache.credentials().is_none());

        cache.token = Some(String::new());
        assert!(cache.credentials().is_none());

        cache.token = Some("secret".to_string());
        assert!(cache.credentials().is_some());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let result = load_yaml(&dir, "limiter: [");
        assert!(matches!(result, Err(WindowguardError::Config(_))));
    }

    #[test]
    fn test_load_fills_missing_fields_with_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_yaml(&dir, "limiter:\n  default_max: 42\n").unwrap();
        assert_eq!(config.limiter.default_max, 42);
        assert_eq!(config.limiter.default_window_ms, 60_000);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.yaml");
        let result = WindowguardConfig::load(Some(path.to_str().unwrap()));
        assert!(matches!(result, Err(WindowguardError::Config(_))));
    }
}
