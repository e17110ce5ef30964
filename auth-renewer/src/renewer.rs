use crate::authorizer::Authorizer;
use crate::credentials::{unescape, Credentials};
use crate::error::RenewerError;
use crate::keys::{StorageKeys, AUTH_REQUESTS_CHANNEL};
use crate::kv::KvStore;
use crate::metrics::RenewerMetrics;
use crate::storage::Storage;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, warn};

type AuthKey = (String, String, String);

/// Bounded worker pool sizing. `max` bounds concurrency directly (via a
/// semaphore); `min` is accepted for configuration parity with the original
/// thread-pool shape and recorded for operators, but this implementation has
/// no persistent idle workers to keep warm — see DESIGN.md.
#[derive(Debug, Clone, Copy)]
pub struct PoolSize {
    pub min: usize,
    pub max: usize,
}

/// Subscribe to `auth_requests`, dedup in-flight work, dispatch to a bounded
/// worker pool, renew + cache + publish (SPEC_FULL.md §4.4).
pub struct PriorityAuthRenewer {
    authorizer: Arc<Authorizer>,
    storage: Arc<Storage>,
    publisher: Arc<dyn KvStore>,
    subscriber: Arc<dyn KvStore>,
    auth_valid_secs: Duration,
    current_auths: Arc<Mutex<HashSet<AuthKey>>>,
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    shutdown: Arc<Notify>,
    metrics: Arc<RenewerMetrics>,
}

impl PriorityAuthRenewer {
    pub fn new(
        authorizer: Authorizer,
        storage: Storage,
        publisher: Arc<dyn KvStore>,
        subscriber: Arc<dyn KvStore>,
        auth_valid_secs: Duration,
        pool: PoolSize,
        metrics: Arc<RenewerMetrics>,
    ) -> Self {
        metrics.set_pool_capacity(pool.max as i64);
        Self {
            authorizer: Arc::new(authorizer),
            storage: Arc::new(storage),
            publisher,
            subscriber,
            auth_valid_secs,
            current_auths: Arc::new(Mutex::new(HashSet::new())),
            semaphore: Arc::new(Semaphore::new(pool.max)),
            max_permits: pool.max,
            shutdown: Arc::new(Notify::new()),
            metrics,
        }
    }

    /// Blocks in the request subscription loop. Returns `Ok(())` on a clean
    /// shutdown, `Err` only when the subscription primitive itself fails
    /// (re-raised after logging, per SPEC_FULL.md §4.4 `start()`).
    pub async fn start(&self) -> Result<(), RenewerError> {
        let mut subscription = self
            .subscriber
            .subscribe(AUTH_REQUESTS_CHANNEL)
            .await
            .map_err(|err| {
                error!(?err, "failed to subscribe to auth requests channel");
                RenewerError::Subscription(err)
            })?;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("shutdown requested, leaving subscription loop");
                    break;
                }
                message = subscription.recv() => {
                    match message {
                        Some(message) => self.handle_message(&message).await,
                        None => {
                            debug!("subscription channel closed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop accepting new requests. In-flight tasks are left to run to
    /// completion; call [`Self::wait_for_termination`] to block until they
    /// do.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Blocks until every in-flight renewal task has completed. Every
    /// running task holds one semaphore permit for its lifetime, so once all
    /// `max_permits` can be acquired simultaneously, nothing is still
    /// running.
    pub async fn wait_for_termination(&self) {
        let _ = self.semaphore.acquire_many(self.max_permits as u32).await;
    }

    async fn handle_message(&self, message: &str) {
        let Some((service_id, creds_canonical, metric)) = parse_request(message) else {
            warn!(message, "malformed auth request message, skipping");
            self.metrics.record_malformed_request();
            return;
        };
        let key: AuthKey = (service_id.clone(), creds_canonical.clone(), metric.clone());

        {
            let mut guard = self.current_auths.lock().await;
            if guard.contains(&key) {
                debug!(service = %service_id, metric, "renewal already in flight, deduping");
                self.metrics.record_dedup_hit();
                return;
            }
            guard.insert(key.clone());
        }

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                error!(?err, service = %service_id, metric, "failed to acquire worker pool permit");
                DedupGuard::new(Arc::clone(&self.current_auths), key).release_now().await;
                return;
            }
        };

        let authorizer = Arc::clone(&self.authorizer);
        let storage = Arc::clone(&self.storage);
        let publisher = Arc::clone(&self.publisher);
        let current_auths = Arc::clone(&self.current_auths);
        let metrics = Arc::clone(&self.metrics);
        let auth_valid_secs = self.auth_valid_secs;

        tokio::spawn(async move {
            let _permit = permit;
            let guard = DedupGuard::new(current_auths, key.clone());
            let (service_id, creds_canonical, metric) = key;
            renew_and_publish_task(
                authorizer,
                storage,
                publisher,
                auth_valid_secs,
                service_id,
                creds_canonical,
                metric,
                metrics,
            )
            .await;
            // Explicit release on the normal (non-panicking) path, so
            // `wait_for_termination` — which only tracks the semaphore permit
            // released right after this — observes the dedup key already
            // gone. `Drop` below only covers an unwinding panic.
            guard.release_now().await;
        });
    }
}

/// Releases `(service, creds, metric)` from `current_auths`. The normal path
/// calls [`Self::release_now`] explicitly as the last step of the task body;
/// `Drop` exists only to cover an unwinding panic partway through that body,
/// where there's no later statement left to run the explicit release. Drop
/// can't `await`, so that fallback path spawns a detached task — acceptable
/// there because a panic is already an abnormal, best-effort cleanup path,
/// unlike the guaranteed-release normal completion path above it.
struct DedupGuard {
    current_auths: Arc<Mutex<HashSet<AuthKey>>>,
    key: Option<AuthKey>,
}

impl DedupGuard {
    fn new(current_auths: Arc<Mutex<HashSet<AuthKey>>>, key: AuthKey) -> Self {
        Self {
            current_auths,
            key: Some(key),
        }
    }

    async fn release_now(mut self) {
        if let Some(key) = self.key.take() {
            self.current_auths.lock().await.remove(&key);
        }
    }
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let current_auths = Arc::clone(&self.current_auths);
            tokio::spawn(async move {
                current_auths.lock().await.remove(&key);
            });
        }
    }
}

async fn renew_and_publish_task(
    authorizer: Arc<Authorizer>,
    storage: Arc<Storage>,
    publisher: Arc<dyn KvStore>,
    auth_valid_secs: Duration,
    service_id: String,
    creds_canonical: String,
    metric: String,
    metrics: Arc<RenewerMetrics>,
) {
    let creds = parse_credentials_canonical(&creds_canonical);

    let authorizations = match authorizer
        .authorizations(&service_id, &creds, std::slice::from_ref(&metric))
        .await
    {
        Ok(authorizations) => authorizations,
        Err(err) => {
            error!(?err, service = %service_id, metric, "authorizer call failed, abandoning renewal");
            metrics.record_renewal_failure();
            return;
        }
    };

    if let Err(err) = storage
        .renew_auths(&service_id, &creds, &authorizations, auth_valid_secs)
        .await
    {
        error!(?err, service = %service_id, metric, "failed to write renewed authorizations to cache");
        metrics.record_renewal_failure();
        return;
    }

    metrics.record_renewal_success();

    let Some(decision) = authorizations.get(&metric) else {
        warn!(service = %service_id, metric, "authorizer did not return a decision for the requested metric");
        return;
    };

    let channel = StorageKeys::pubsub_auths_resp_channel(&service_id, &creds, &metric);
    if let Err(err) = publisher.publish(&channel, &decision.to_cache_string()).await {
        warn!(?err, channel, "failed to publish renewed authorization; cache was already updated");
    }
}

/// Parses `service_id:<s>,<creds-canonical>,metric:<m>` (SPEC_FULL.md §6).
/// Assumes `service_id` and `metric` values don't themselves contain the
/// structural delimiters (`,` immediately after `service_id:`, or the
/// literal substring `,metric:`) — true for the identifier-shaped values
/// these fields carry in practice.
fn parse_request(message: &str) -> Option<(String, String, String)> {
    let after_service_prefix = message.strip_prefix("service_id:")?;
    let metric_marker = ",metric:";
    let marker_index = after_service_prefix.rfind(metric_marker)?;
    let (before_metric, after_marker) = after_service_prefix.split_at(marker_index);
    let metric = after_marker[metric_marker.len()..].to_string();

    let comma_index = before_metric.find(',')?;
    let service_id = before_metric[..comma_index].to_string();
    let creds_canonical = before_metric[comma_index + 1..].to_string();

    if service_id.is_empty() || creds_canonical.is_empty() || metric.is_empty() {
        return None;
    }
    Some((service_id, creds_canonical, metric))
}

/// Encodes the wire format client handlers publish to `AUTH_REQUESTS_CHANNEL`.
pub fn encode_auth_request(service_id: &str, creds: &Credentials, metric: &str) -> String {
    format!(
        "service_id:{},{},metric:{}",
        service_id,
        creds.to_sorted_escaped_s(),
        metric
    )
}

/// Reconstructs a [`Credentials`] from its canonical wire form. The OAuth
/// flag isn't part of the canonical grammar (SPEC_FULL.md §3), so it's
/// inferred from the presence of an `access_token` field — the conventional
/// name an OAuth-flavored credential set carries.
fn parse_credentials_canonical(canonical: &str) -> Credentials {
    let mut map = BTreeMap::new();
    for pair in canonical.split(',') {
        if let Some((key, value)) = pair.split_once(':') {
            map.insert(unescape(key), unescape(value));
        }
    }
    let oauth = map.contains_key("access_token");
    Credentials::new(map, oauth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pairs: &[(&str, &str)]) -> Credentials {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Credentials::new(map, false)
    }

    #[test]
    fn parse_request_round_trips_with_encode() {
        let c = creds(&[("user_key", "a_user_key")]);
        let message = encode_auth_request("a_service_id", &c, "a_metric");
        assert_eq!(message, "service_id:a_service_id,user_key:a_user_key,metric:a_metric");

        let (service, creds_canonical, metric) = parse_request(&message).unwrap();
        assert_eq!(service, "a_service_id");
        assert_eq!(creds_canonical, "user_key:a_user_key");
        assert_eq!(metric, "a_metric");
    }

    #[test]
    fn parse_request_rejects_malformed_messages() {
        assert!(parse_request("not even close").is_none());
        assert!(parse_request("service_id:a,metric:b").is_none()); // missing creds section
    }

    #[test]
    fn parse_credentials_canonical_reconstructs_fields() {
        let c = creds(&[("app_id", "x"), ("app_key", "y")]);
        let canonical = c.to_sorted_escaped_s();
        let parsed = parse_credentials_canonical(&canonical);
        assert_eq!(parsed.creds().get("app_id"), Some(&"x".to_string()));
        assert_eq!(parsed.creds().get("app_key"), Some(&"y".to_string()));
        assert!(!parsed.is_oauth());
    }

    #[test]
    fn parse_credentials_canonical_detects_oauth_by_access_token_field() {
        let c = creds(&[("access_token", "tok")]);
        let canonical = c.to_sorted_escaped_s();
        let parsed = parse_credentials_canonical(&canonical);
        assert!(parsed.is_oauth());
    }
}
