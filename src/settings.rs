//! Settings for the demo server: the global options, the store backend and
//! per-route overrides.

use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::info;

use crate::{
    config::{RateLimitOptions, RouteRateLimit},
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    redis::{RedisConfig, RedisStore},
    request::RouteInfo,
    store::{CounterStore, LocalStore, DEFAULT_CACHE_SIZE},
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rate_limit: RateLimitOptions,
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub routes: Vec<RouteSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreSettings {
    Local {
        #[serde(default = "default_cache_size")]
        cache: usize,
        #[serde(default = "default_sweep_interval", with = "humantime_serde")]
        sweep_interval: Duration,
    },
    Redis(RedisConfig),
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Local {
            cache: default_cache_size(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub http_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSettings {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub rate_limit: RouteRateLimit,
}

impl Settings {
    /// Build a limiter with every configured route registered
    pub fn build_limiter(&self, backend: Arc<dyn CounterStore>) -> Result<RateLimiter> {
        let mut limiter = RateLimiter::new(self.rate_limit.clone(), backend)?;
        for route in &self.routes {
            limiter.register_route(
                RouteInfo::new(route.method.as_str(), route.url.as_str()),
                route.rate_limit.clone(),
            )?;
        }
        Ok(limiter)
    }
}

/// Create the configured counter store
pub async fn build_store(settings: &StoreSettings) -> Result<Arc<dyn CounterStore>> {
    match settings {
        StoreSettings::Local {
            cache,
            sweep_interval,
        } => {
            info!(cache, "Using local counter store");
            let store = LocalStore::new(*cache);
            store.spawn_sweeper(*sweep_interval);
            Ok(Arc::new(store))
        }
        StoreSettings::Redis(config) => {
            info!(url = %config.url, "Using Redis counter store");
            Ok(Arc::new(RedisStore::connect(config.clone()).await?))
        }
    }
}

/// Load settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load settings from a file, then apply `RATELIMIT__*` environment overrides
pub fn load_settings_from_file(path: &str) -> Result<Settings> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path))
        .add_source(::config::Environment::with_prefix("RATELIMIT").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
