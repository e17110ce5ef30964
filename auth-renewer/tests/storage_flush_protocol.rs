use auth_renewer::keys::StorageKeys;
use auth_renewer::kv::test_support::{FailingKvStore, InMemoryKvStore};
use auth_renewer::kv::KvStore;
use auth_renewer::{Credentials, Storage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

fn creds(user_key: &str) -> Credentials {
    let mut map = BTreeMap::new();
    map.insert("user_key".to_string(), user_key.to_string());
    Credentials::new(map, false)
}

#[tokio::test]
async fn concurrent_reports_for_distinct_applications_all_survive_a_flush() {
    let kv = InMemoryKvStore::new();
    let storage = Storage::with_retry_delay(kv, Duration::from_millis(1));

    for i in 0..5 {
        let mut usage = HashMap::new();
        usage.insert("hits".to_string(), (i + 1) as i64);
        storage
            .report(&[(format!("svc{i}"), creds(&format!("u{i}")), usage)])
            .await
            .unwrap();
    }

    let flushed = storage.reports_to_flush().await;
    assert_eq!(flushed.len(), 5);
    let total: i64 = flushed.iter().map(|r| r.usage.get("hits").copied().unwrap_or(0)).sum();
    assert_eq!(total, 1 + 2 + 3 + 4 + 5);
}

#[tokio::test]
async fn usage_accumulated_after_a_flush_starts_is_not_lost_by_that_flush() {
    let kv = InMemoryKvStore::new();
    let storage = Storage::with_retry_delay(kv, Duration::from_millis(1));

    let mut usage = HashMap::new();
    usage.insert("hits".to_string(), 3i64);
    storage
        .report(&[("svc".to_string(), creds("u1"), usage)])
        .await
        .unwrap();

    let first_flush = storage.reports_to_flush().await;
    assert_eq!(first_flush[0].usage.get("hits"), Some(&3));

    // A report arriving after the snapshot rename must start a fresh
    // accumulation, not be swallowed into the batch that was just flushed.
    let mut usage2 = HashMap::new();
    usage2.insert("hits".to_string(), 4i64);
    storage
        .report(&[("svc".to_string(), creds("u1"), usage2)])
        .await
        .unwrap();

    let second_flush = storage.reports_to_flush().await;
    assert_eq!(second_flush.len(), 1);
    assert_eq!(second_flush[0].usage.get("hits"), Some(&4));
}

#[tokio::test]
async fn a_single_failed_rename_in_a_flush_batch_loses_no_data() {
    let base = Arc::new(InMemoryKvStore::new());
    let failing = Arc::new(FailingKvStore::new(base.clone() as Arc<dyn KvStore>));
    let storage = Storage::from_arc(failing.clone() as Arc<dyn KvStore>);

    let mut usage_a = HashMap::new();
    usage_a.insert("hits".to_string(), 3i64);
    let mut usage_b = HashMap::new();
    usage_b.insert("hits".to_string(), 9i64);
    storage
        .report(&[
            ("svcA".to_string(), creds("ua"), usage_a),
            ("svcB".to_string(), creds("ub"), usage_b),
        ])
        .await
        .unwrap();

    let stuck_key = StorageKeys::report_hash_key("svcA", &creds("ua"));
    failing.fail_rename_from(&stuck_key).await;

    let flushed = storage.reports_to_flush().await;

    // svcB's rename succeeded and is in this cycle's flush.
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].service_id, "svcB");
    assert_eq!(flushed[0].usage.get("hits"), Some(&9));

    // svcA's rename failed, so its original report hash is left exactly
    // where it was, untouched and undeleted — no usage lost.
    let stranded = base.hgetall(&stuck_key).await.unwrap();
    assert_eq!(stranded.get("hits"), Some(&"3".to_string()));

    // The next usage report for svcA re-registers its hash key in the
    // cached-reports set (the top-level set that drove this flush is gone,
    // renamed and deleted already), so a later cycle picks the stranded
    // data back up rather than leaking it forever.
    let mut more_usage = HashMap::new();
    more_usage.insert("hits".to_string(), 1i64);
    storage
        .report(&[("svcA".to_string(), creds("ua"), more_usage)])
        .await
        .unwrap();

    let flushed2 = storage.reports_to_flush().await;
    assert_eq!(flushed2.len(), 1);
    assert_eq!(flushed2[0].service_id, "svcA");
    assert_eq!(flushed2[0].usage.get("hits"), Some(&4));
}

#[tokio::test]
async fn empty_set_produces_no_flush_and_leaves_nothing_behind() {
    let kv = InMemoryKvStore::new();
    let storage = Storage::new(kv);
    assert!(storage.reports_to_flush().await.is_empty());
    assert!(storage.reports_to_flush().await.is_empty());
}
