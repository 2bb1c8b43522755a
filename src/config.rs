//! Configuration management for Gatekeep.
//!
//! A config names the backend and the limiters to build on it:
//!
//! ```yaml
//! backend:
//!   kind: local
//!   sweep_interval_ms: 30000
//! limiters:
//!   - algorithm: token_bucket
//!     name: api
//!     capacity: 100
//!     refill_amount: 10
//!     refill_interval_ms: 1000
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{
    FixedWindowLimiter, LeakyBucketLimiter, RateLimiter, SlidingLogLimiter, SlidingWindowLimiter,
    ThrottlingLimiter, TokenBucketLimiter, Unlimited,
};
use crate::store::{LocalStore, StateStore, Sweeper};

/// Prefix for environment overrides, e.g. `GATEKEEP__BACKEND__URL`.
const ENV_PREFIX: &str = "GATEKEEP";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeepConfig {
    /// Where limiter state lives
    #[serde(default)]
    pub backend: BackendConfig,

    /// Limiters to build on the backend
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

/// State store selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process memory
    Local {
        /// How often to purge expired keys; no sweeping when unset
        #[serde(default = "default_sweep_interval")]
        sweep_interval_ms: Option<u64>,
    },
    /// A shared Redis server
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> Option<u64> {
    Some(60_000)
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// A connected backend. Dropping it stops the local sweeper, if any.
#[derive(Debug)]
pub struct Backend {
    pub store: StateStore,
    pub sweeper: Option<Sweeper>,
}

impl BackendConfig {
    /// Open the configured store.
    pub async fn connect(&self) -> Result<Backend> {
        match self {
            BackendConfig::Local { sweep_interval_ms } => {
                let local = LocalStore::new();
                let sweeper = sweep_interval_ms
                    .filter(|ms| *ms > 0)
                    .map(|ms| local.spawn_sweeper(Duration::from_millis(ms)));
                info!(sweeping = sweeper.is_some(), "Using local state store");
                Ok(Backend {
                    store: local.into(),
                    sweeper,
                })
            }
            BackendConfig::Redis { url } => {
                info!("Using Redis state store");
                Ok(Backend {
                    store: StateStore::redis(url).await?,
                    sweeper: None,
                })
            }
        }
    }
}

/// One limiter, tagged by algorithm. Intervals are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    FixedWindow {
        name: String,
        limit: u64,
        interval_ms: u64,
    },
    SlidingWindow {
        name: String,
        limit: u64,
        interval_ms: u64,
    },
    SlidingLog {
        name: String,
        limit: u64,
        interval_ms: u64,
    },
    TokenBucket {
        name: String,
        capacity: u64,
        refill_amount: u64,
        refill_interval_ms: u64,
    },
    LeakyBucket {
        name: String,
        capacity: u64,
        interval_ms: u64,
    },
    Throttling {
        name: String,
        min_interval_ms: u64,
    },
    Unlimited {
        name: String,
    },
}

impl LimiterConfig {
    /// The limiter's name.
    pub fn name(&self) -> &str {
        match self {
            LimiterConfig::FixedWindow { name, .. }
            | LimiterConfig::SlidingWindow { name, .. }
            | LimiterConfig::SlidingLog { name, .. }
            | LimiterConfig::TokenBucket { name, .. }
            | LimiterConfig::LeakyBucket { name, .. }
            | LimiterConfig::Throttling { name, .. }
            | LimiterConfig::Unlimited { name } => name,
        }
    }

    /// Validate and build the limiter on `store`.
    pub fn build(&self, store: &StateStore) -> Result<Arc<dyn RateLimiter>> {
        let store = store.clone();
        let limiter: Arc<dyn RateLimiter> = match self {
            LimiterConfig::FixedWindow {
                name,
                limit,
                interval_ms,
            } => Arc::new(FixedWindowLimiter::new(
                name.as_str(),
                *limit,
                Duration::from_millis(*interval_ms),
                store,
            )?),
            LimiterConfig::SlidingWindow {
                name,
                limit,
                interval_ms,
            } => Arc::new(SlidingWindowLimiter::new(
                name.as_str(),
                *limit,
                Duration::from_millis(*interval_ms),
                store,
            )?),
            LimiterConfig::SlidingLog {
                name,
                limit,
                interval_ms,
            } => Arc::new(SlidingLogLimiter::new(
                name.as_str(),
                *limit,
                Duration::from_millis(*interval_ms),
                store,
            )?),
            LimiterConfig::TokenBucket {
                name,
                capacity,
                refill_amount,
                refill_interval_ms,
            } => Arc::new(TokenBucketLimiter::new(
                name.as_str(),
                *capacity,
                *refill_amount,
                Duration::from_millis(*refill_interval_ms),
                store,
            )?),
            LimiterConfig::LeakyBucket {
                name,
                capacity,
                interval_ms,
            } => Arc::new(LeakyBucketLimiter::new(
                name.as_str(),
                *capacity,
                Duration::from_millis(*interval_ms),
                store,
            )?),
            LimiterConfig::Throttling {
                name,
                min_interval_ms,
            } => Arc::new(ThrottlingLimiter::new(
                name.as_str(),
                Duration::from_millis(*min_interval_ms),
                store,
            )?),
            LimiterConfig::Unlimited { name } => Arc::new(Unlimited::new(name.as_str())),
        };
        Ok(limiter)
    }
}

impl GatekeepConfig {
    /// Load configuration from a YAML file, with `GATEKEEP__*` environment
    /// variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(RateLimitError::Configuration(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let config = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Build every configured limiter on `store`.
    ///
    /// Fails on the first invalid limiter or on duplicate names.
    pub fn build_limiters(&self, store: &StateStore) -> Result<Vec<Arc<dyn RateLimiter>>> {
        let mut seen = HashSet::new();
        self.limiters
            .iter()
            .map(|limiter| {
                if !seen.insert(limiter.name()) {
                    return Err(RateLimitError::Configuration(format!(
                        "duplicate limiter name '{}'",
                        limiter.name()
                    )));
                }
                limiter.build(store)
            })
            .collect()
    }

    /// Look up a limiter by name.
    pub fn limiter(&self, name: &str) -> Option<&LimiterConfig> {
        self.limiters.iter().find(|l| l.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
backend:
  kind: local
  sweep_interval_ms: 1000
limiters:
  - algorithm: fixed_window
    name: login
    limit: 5
    interval_ms: 60000
  - algorithm: token_bucket
    name: api
    capacity: 100
    refill_amount: 10
    refill_interval_ms: 1000
  - algorithm: throttling
    name: webhook
    min_interval_ms: 250
  - algorithm: unlimited
    name: internal
"#;

    #[test]
    fn test_parse_config() {
        let config = GatekeepConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Local {
                sweep_interval_ms: Some(1000)
            }
        );
        assert_eq!(config.limiters.len(), 4);
        assert_eq!(
            config.limiter("webhook"),
            Some(&LimiterConfig::Throttling {
                name: "webhook".to_string(),
                min_interval_ms: 250
            })
        );
        assert!(config.limiter("missing").is_none());
    }

    #[test]
    fn test_defaults() {
        let config = GatekeepConfig::from_yaml("limiters: []").unwrap();
        assert_eq!(config.backend, BackendConfig::default());

        let redis = GatekeepConfig::from_yaml("backend:\n  kind: redis\n").unwrap();
        assert_eq!(
            redis.backend,
            BackendConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let yaml = r#"
limiters:
  - algorithm: magic
    name: x
"#;
        assert!(matches!(
            GatekeepConfig::from_yaml(yaml),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_build_limiters() {
        let config = GatekeepConfig::from_yaml(SAMPLE).unwrap();
        let store = StateStore::local();
        let limiters = config.build_limiters(&store).unwrap();

        let names: Vec<_> = limiters.iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["login", "api", "webhook", "internal"]);

        let login = &limiters[0];
        assert_eq!(login.check("alice").await.unwrap().remaining, 4);
    }

    #[test]
    fn test_invalid_limiter_fails_construction() {
        let yaml = r#"
limiters:
  - algorithm: sliding_window
    name: broken
    limit: 0
    interval_ms: 1000
"#;
        let config = GatekeepConfig::from_yaml(yaml).unwrap();
        let err = config.build_limiters(&StateStore::local()).err().unwrap();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
limiters:
  - algorithm: unlimited
    name: same
  - algorithm: throttling
    name: same
    min_interval_ms: 10
"#;
        let config = GatekeepConfig::from_yaml(yaml).unwrap();
        assert!(config.build_limiters(&StateStore::local()).is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("gatekeep-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE).unwrap();

        let config = GatekeepConfig::from_file(&path).unwrap();
        assert_eq!(config.limiters.len(), 4);

        std::fs::remove_file(&path).unwrap();
        assert!(GatekeepConfig::from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_local_backend_connect() {
        let backend = BackendConfig::default().connect().await.unwrap();
        assert_eq!(backend.store.backend_name(), "local");
        assert!(backend.sweeper.is_some());

        let unswept = BackendConfig::Local {
            sweep_interval_ms: None,
        }
        .connect()
        .await
        .unwrap();
        assert!(unswept.sweeper.is_none());
    }
}
