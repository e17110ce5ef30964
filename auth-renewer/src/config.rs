use anyhow::{Context, Result};
use std::env;

/// Environment-driven configuration for the renewer daemon. Follows
/// `integration-gateway`'s `GatewayConfig::from_env` pattern exactly:
/// required variables fail fast with `.context(...)`, optional ones fall
/// back to a default, and positive-only values are clamped with `.max(...)`.
#[derive(Debug, Clone)]
pub struct Config {
    pub auth_valid_secs: u64,
    pub pool_min_threads: usize,
    pub pool_max_threads: usize,
    pub storage_redis_url: String,
    pub publisher_redis_url: String,
    pub subscriber_redis_url: String,
    pub upstream_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let storage_redis_url =
            env::var("STORAGE_REDIS_URL").context("STORAGE_REDIS_URL must be set")?;
        let publisher_redis_url = env::var("PUBLISHER_REDIS_URL")
            .unwrap_or_else(|_| storage_redis_url.clone());
        let subscriber_redis_url = env::var("SUBSCRIBER_REDIS_URL")
            .unwrap_or_else(|_| storage_redis_url.clone());
        let upstream_base_url =
            env::var("UPSTREAM_BASE_URL").context("UPSTREAM_BASE_URL must be set")?;

        let auth_valid_secs = env::var("AUTH_VALID_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(300)
            .max(1);
        let pool_min_threads = env::var("RENEWER_POOL_MIN_THREADS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(2)
            .max(1);
        let pool_max_threads = env::var("RENEWER_POOL_MAX_THREADS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(16)
            .max(pool_min_threads);

        Ok(Self {
            auth_valid_secs,
            pool_min_threads,
            pool_max_threads,
            storage_redis_url,
            publisher_redis_url,
            subscriber_redis_url,
            upstream_base_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_max_is_clamped_to_at_least_pool_min() {
        std::env::set_var("STORAGE_REDIS_URL", "redis://localhost:6379");
        std::env::set_var("UPSTREAM_BASE_URL", "https://upstream.example");
        std::env::set_var("RENEWER_POOL_MIN_THREADS", "10");
        std::env::set_var("RENEWER_POOL_MAX_THREADS", "1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.pool_min_threads, 10);
        assert_eq!(config.pool_max_threads, 10);
        std::env::remove_var("RENEWER_POOL_MIN_THREADS");
        std::env::remove_var("RENEWER_POOL_MAX_THREADS");
        std::env::remove_var("STORAGE_REDIS_URL");
        std::env::remove_var("UPSTREAM_BASE_URL");
    }
}
