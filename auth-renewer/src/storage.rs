use crate::authorization::Authorization;
use crate::credentials::Credentials;
use crate::error::{KvError, StorageError};
use crate::keys::{StorageKeys, SET_KEYS_CACHED_REPORTS};
use crate::kv::KvStore;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Number of hash fields / keys processed per KV round-trip, so a single
/// large application or flush cycle never blocks the KV server on one giant
/// command (SPEC_FULL.md §4.3).
const BATCH: usize = 500;

/// One application's accumulated usage, ready to be reported upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageToReport {
    pub service_id: String,
    /// Canonical credentials string recovered from the report key, not a
    /// reconstructed [`Credentials`] — see [`StorageKeys::service_and_creds`].
    pub creds_canonical: String,
    pub usage: HashMap<String, i64>,
}

/// Batched, failure-tolerant KV operations: write authorizations with TTL,
/// and run the snapshot-and-flush protocol for usage reports
/// (SPEC_FULL.md §4.3). Holds its KV collaborator as a trait object for the
/// same reason [`crate::authorizer::Authorizer`] does.
pub struct Storage {
    kv: Arc<dyn KvStore>,
    retry_delay: Duration,
}

impl Storage {
    pub fn new(kv: impl KvStore + 'static) -> Self {
        Self {
            kv: Arc::new(kv),
            retry_delay: Duration::from_millis(100),
        }
    }

    pub fn from_arc(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            retry_delay: Duration::from_millis(100),
        }
    }

    /// Open Question resolution (SPEC_FULL.md §9): the cleanup retry delay is
    /// injectable so tests don't have to wait on real sleeps.
    pub fn with_retry_delay(kv: impl KvStore + 'static, retry_delay: Duration) -> Self {
        Self {
            kv: Arc::new(kv),
            retry_delay,
        }
    }

    pub async fn renew_auths(
        &self,
        service_id: &str,
        creds: &Credentials,
        authorizations: &HashMap<String, Authorization>,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let hash_key = StorageKeys::auth_hash_key(service_id, creds);
        let fields: Vec<(String, String)> = authorizations
            .iter()
            .map(|(metric, auth)| (metric.clone(), auth.to_cache_string()))
            .collect();

        let write = async {
            for chunk in fields.chunks(BATCH) {
                self.kv.hset_many(&hash_key, chunk).await?;
            }
            self.kv.expire(&hash_key, ttl.as_secs()).await
        }
        .await;

        write.map_err(|_: KvError| StorageError::RenewAuth {
            service: service_id.to_string(),
            creds: creds.clone(),
        })
    }

    pub async fn report(
        &self,
        reports: &[(String, Credentials, HashMap<String, i64>)],
    ) -> Result<(), StorageError> {
        for chunk in reports.chunks(BATCH) {
            for (service_id, creds, usage) in chunk {
                let hash_key = StorageKeys::report_hash_key(service_id, creds);
                for (metric, delta) in usage {
                    self.kv.hincrby(&hash_key, metric, *delta).await?;
                }
                self.kv.sadd(SET_KEYS_CACHED_REPORTS, &hash_key).await?;
            }
        }
        Ok(())
    }

    /// The atomic-snapshot flush protocol (SPEC_FULL.md §4.3). Every failure
    /// mode is handled so that accumulated usage is never lost, only
    /// possibly delayed to a later cycle.
    pub async fn reports_to_flush(&self) -> Vec<UsageToReport> {
        let suffix = generate_suffix();

        let cardinality = match self.kv.scard(SET_KEYS_CACHED_REPORTS).await {
            Ok(n) => n,
            Err(err) => {
                error!(?err, "failed to read cached reports set cardinality");
                return Vec::new();
            }
        };
        if cardinality == 0 {
            return Vec::new();
        }

        let flushing_set = StorageKeys::flushing_report_keys_set(&suffix);
        if let Err(err) = self.kv.rename(SET_KEYS_CACHED_REPORTS, &flushing_set).await {
            error!(?err, suffix, "failed to rename cached reports set for flush");
            return Vec::new();
        }

        let report_keys = match self.kv.smembers(&flushing_set).await {
            Ok(keys) => keys,
            Err(err) => {
                error!(?err, suffix, "failed to read flushing report keys; leaving set for recovery");
                return Vec::new();
            }
        };
        // Only reached on a successful read: the flushing set's job is done,
        // its membership now lives in the per-key renamed hashes below.
        self.delete_with_retry(vec![flushing_set]).await;

        let renamed_keys = self.rename_to_flush_batch(&report_keys, &suffix).await;

        self.collect_flushed_reports(&renamed_keys, &suffix).await
    }

    async fn rename_to_flush_batch(&self, report_keys: &[String], suffix: &str) -> Vec<String> {
        let mut renamed = Vec::with_capacity(report_keys.len());
        for chunk in report_keys.chunks(BATCH) {
            for key in chunk {
                let target = StorageKeys::name_key_to_flush(key, suffix);
                match self.kv.rename(key, &target).await {
                    Ok(()) => renamed.push(target),
                    Err(err) => {
                        warn!(
                            ?err,
                            key,
                            suffix,
                            "failed to rename report key for flush; it will be picked up on a later cycle"
                        );
                    }
                }
            }
        }
        renamed
    }

    async fn collect_flushed_reports(&self, renamed_keys: &[String], suffix: &str) -> Vec<UsageToReport> {
        let mut results = Vec::new();
        for chunk in renamed_keys.chunks(BATCH) {
            let mut successfully_read = Vec::new();
            for key in chunk {
                match self.kv.hgetall(key).await {
                    Ok(fields) if !fields.is_empty() => {
                        if let Ok((service_id, creds_canonical)) =
                            StorageKeys::service_and_creds(key, suffix)
                        {
                            let usage = fields
                                .into_iter()
                                .filter_map(|(metric, value)| {
                                    value.parse::<i64>().ok().map(|n| (metric, n))
                                })
                                .collect();
                            results.push(UsageToReport {
                                service_id,
                                creds_canonical,
                                usage,
                            });
                        }
                        successfully_read.push(key.clone());
                    }
                    Ok(_) => {
                        // Empty hash: nothing to report, but still safe to delete.
                        successfully_read.push(key.clone());
                    }
                    Err(err) => {
                        warn!(?err, key, "some reports missing");
                    }
                }
            }
            self.delete_with_retry(successfully_read).await;
        }
        results
    }

    /// Retries up to 3 times with the configured backoff on failure; on
    /// final failure logs the stranded keys rather than losing them
    /// silently (SPEC_FULL.md §4.3 step 7).
    async fn delete_with_retry(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.kv.delete(&keys).await {
                Ok(()) => return,
                Err(err) if attempt < MAX_ATTEMPTS => {
                    warn!(?err, attempt, "delete failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    error!(?err, ?keys, "cleanup error");
                }
            }
        }
    }
}

/// `"_" + UTC YYYYMMDDHHMMSS` plus a random 4-hex-digit tiebreaker, so two
/// flush cycles started within the same second never collide
/// (SPEC_FULL.md §4.3 step 1).
fn generate_suffix() -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let entropy: u16 = rand::thread_rng().gen_range(0..0x10000);
    format!("_{timestamp}_{entropy:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::test_support::InMemoryKvStore;
    use std::collections::BTreeMap;

    fn creds(user_key: &str) -> Credentials {
        let mut map = BTreeMap::new();
        map.insert("user_key".to_string(), user_key.to_string());
        Credentials::new(map, false)
    }

    #[tokio::test]
    async fn renew_auths_writes_all_metrics_and_sets_ttl() {
        let storage = Storage::new(InMemoryKvStore::new());
        let mut authorizations = HashMap::new();
        authorizations.insert("hits".to_string(), Authorization::Allow);
        authorizations.insert("hits#1".to_string(), Authorization::DenyOverLimits);

        storage
            .renew_auths("svc", &creds("u1"), &authorizations, Duration::from_secs(300))
            .await
            .unwrap();

        let hash_key = StorageKeys::auth_hash_key("svc", &creds("u1"));
        let stored = storage.kv.hgetall(&hash_key).await.unwrap();
        assert_eq!(stored.get("hits"), Some(&"1".to_string()));
        assert_eq!(stored.get("hits#1"), Some(&"0:limits_exceeded".to_string()));
        assert_eq!(storage.kv.ttl_of(&hash_key).await, Some(300));
    }

    #[tokio::test]
    async fn report_accumulates_and_registers_key() {
        let storage = Storage::new(InMemoryKvStore::new());
        let mut usage = HashMap::new();
        usage.insert("hits".to_string(), 5i64);
        storage
            .report(&[("svc".to_string(), creds("u1"), usage)])
            .await
            .unwrap();

        let hash_key = StorageKeys::report_hash_key("svc", &creds("u1"));
        let stored = storage.kv.hgetall(&hash_key).await.unwrap();
        assert_eq!(stored.get("hits"), Some(&"5".to_string()));
        let members = storage.kv.smembers(SET_KEYS_CACHED_REPORTS).await.unwrap();
        assert_eq!(members, vec![hash_key]);
    }

    #[tokio::test]
    async fn flush_returns_empty_when_nothing_cached() {
        let storage = Storage::new(InMemoryKvStore::new());
        let reports = storage.reports_to_flush().await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn flush_preserves_counts_and_resets_next_cycle() {
        let storage = Storage::with_retry_delay(InMemoryKvStore::new(), Duration::from_millis(1));
        let mut usage = HashMap::new();
        usage.insert("hits".to_string(), 7i64);
        storage
            .report(&[("svc".to_string(), creds("u1"), usage)])
            .await
            .unwrap();

        let flushed = storage.reports_to_flush().await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].service_id, "svc");
        assert_eq!(flushed[0].usage.get("hits"), Some(&7));

        // The original report hash and set membership are gone.
        let hash_key = StorageKeys::report_hash_key("svc", &creds("u1"));
        assert!(storage.kv.hgetall(&hash_key).await.unwrap().is_empty());
        assert_eq!(storage.kv.scard(SET_KEYS_CACHED_REPORTS).await.unwrap(), 0);

        // A subsequent report starts from 0, not from the flushed value.
        let mut usage2 = HashMap::new();
        usage2.insert("hits".to_string(), 2i64);
        storage
            .report(&[("svc".to_string(), creds("u1"), usage2)])
            .await
            .unwrap();
        let flushed2 = storage.reports_to_flush().await;
        assert_eq!(flushed2[0].usage.get("hits"), Some(&2));
    }

    #[tokio::test]
    async fn two_flush_cycles_produce_distinct_suffixes() {
        let a = generate_suffix();
        let b = generate_suffix();
        assert_ne!(a, b);
    }
}
