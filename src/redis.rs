use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{ChildOptions, Counter, CounterStore, IncrRequest},
};

/// Increment a counter and keep its expiry in step with the window.
///
/// The first hit of a window arms the expiry. With continue-exceeding, every
/// hit past `max` re-arms it. A key that somehow lost its expiry is re-armed
/// so it can never count forever.
const INCR_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local continue_exceeding = ARGV[3] == 'true'

if current == 1 or (continue_exceeding and current > max) then
  redis.call('PEXPIRE', KEYS[1], window)
  return {current, window}
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], window)
  ttl = window
end
return {current, ttl}
"#;

/// Redis client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Redis connection with bounded connect and command times
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Connect and verify the server answers PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Creating Redis client");

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            RateLimitError::Redis(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to create connection manager");
                    return Err(RateLimitError::Redis(e));
                }
                Err(_) => {
                    warn!(
                        timeout_ms = config.connection_timeout.as_millis() as u64,
                        "Timeout while creating connection manager"
                    );
                    return Err(RateLimitError::Store(
                        "Timeout while creating Redis connection manager".to_string(),
                    ));
                }
            };

        let redis_client = Self { connection, config };
        redis_client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        match tokio::time::timeout(
            self.config.command_timeout,
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
        {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Store("Redis PING timed out".to_string())),
        }
    }

    async fn invoke_incr(
        &self,
        script: &Script,
        key: &str,
        request: IncrRequest,
        continue_exceeding: bool,
    ) -> Result<Counter> {
        let mut conn = self.connection.clone();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(key)
            .arg(request.time_window_ms)
            .arg(request.max)
            .arg(if continue_exceeding { "true" } else { "false" });

        let (current, ttl): (u64, i64) = tokio::time::timeout(
            self.config.command_timeout,
            invocation.invoke_async::<_, (u64, i64)>(&mut conn),
        )
        .await
        .map_err(|_| RateLimitError::Store(format!("Redis increment of {key} timed out")))??;

        Ok(Counter {
            current,
            ttl_ms: u64::try_from(ttl).unwrap_or(0),
        })
    }
}

/// Shared store keeping counters in Redis so several processes see one budget
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    script: Arc<Script>,
    prefix: String,
    continue_exceeding: bool,
}

impl RedisStore {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            script: Arc::new(Script::new(INCR_SCRIPT)),
            prefix: String::new(),
            continue_exceeding: false,
        }
    }

    pub async fn connect(config: RedisConfig) -> Result<Self> {
        Ok(Self::new(RedisClient::new(config).await?))
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str, request: IncrRequest) -> Result<Counter> {
        let key = format!("{}{}", self.prefix, key);
        self.client
            .invoke_incr(&self.script, &key, request, self.continue_exceeding)
            .await
    }

    fn child(&self, options: &ChildOptions) -> Arc<dyn CounterStore> {
        Arc::new(RedisStore {
            client: self.client.clone(),
            script: self.script.clone(),
            prefix: format!("{}{}", self.prefix, options.scope),
            continue_exceeding: options
                .continue_exceeding
                .unwrap_or(self.continue_exceeding),
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Duration::from_secs(1));

        let config: RedisConfig =
            serde_yaml::from_str("url: redis://cache:6379\ncommand_timeout: 250ms\n").unwrap();
        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = RedisClient::new(config).await.err().unwrap();
        assert!(err.is_store_error());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_window_counting() {
        let store = RedisStore::connect(redis_config()).await.unwrap();
        let scoped = store.child(&ChildOptions {
            scope: format!("test-{}-", std::process::id()),
            continue_exceeding: None,
        });
        let request = IncrRequest {
            time_window_ms: 1000,
            max: 2,
        };

        let first = scoped.incr("k", request).await.unwrap();
        assert_eq!(first.current, 1);
        assert!(first.ttl_ms <= 1000);

        let second = scoped.incr("k", request).await.unwrap();
        assert_eq!(second.current, 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(scoped.incr("k", request).await.unwrap().current, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_continue_exceeding() {
        let store = RedisStore::connect(redis_config()).await.unwrap();
        let scoped = store.child(&ChildOptions {
            scope: format!("test-ce-{}-", std::process::id()),
            continue_exceeding: Some(true),
        });
        let request = IncrRequest {
            time_window_ms: 5000,
            max: 1,
        };

        scoped.incr("k", request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let counter = scoped.incr("k", request).await.unwrap();
        assert_eq!(counter.current, 2);
        assert!(counter.ttl_ms > 4000);
    }
}
