use auth_renewer::{
    Authorizer, Config, PoolSize, PriorityAuthRenewer, RedisKvStore, RenewerMetrics,
    ReqwestUpstreamClient, Storage,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Config::from_env()?;
    let metrics = Arc::new(RenewerMetrics::new()?);

    let storage_kv = RedisKvStore::new(&config.storage_redis_url).await?;
    let publisher_kv = RedisKvStore::new(&config.publisher_redis_url).await?;
    let subscriber_kv = RedisKvStore::new(&config.subscriber_redis_url).await?;

    let upstream = ReqwestUpstreamClient::new(&config.upstream_base_url)?;
    let authorizer = Authorizer::new(upstream);
    let storage = Storage::new(storage_kv);

    let renewer = PriorityAuthRenewer::new(
        authorizer,
        storage,
        Arc::new(publisher_kv),
        Arc::new(subscriber_kv),
        Duration::from_secs(config.auth_valid_secs),
        PoolSize {
            min: config.pool_min_threads,
            max: config.pool_max_threads,
        },
        metrics,
    );

    info!(
        pool_min = config.pool_min_threads,
        pool_max = config.pool_max_threads,
        "starting priority auth renewer"
    );
    renewer.start().await?;
    renewer.wait_for_termination().await;
    Ok(())
}
