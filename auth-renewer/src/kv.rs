use crate::error::KvError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A single channel subscription. Messages arrive in publish order; once the
/// sender side is dropped (the KV connection closes) `recv()` returns
/// `None`. There is no replay: a subscription created after a publish never
/// sees that publish, matching the fire-and-forget broadcast primitive the
/// spec assumes (SPEC_FULL.md §9, "Pub/sub with non-blocking subscribe").
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Trait boundary over the shared KV store: hash field read/write/increment,
/// set membership, rename, TTL, and pub/sub. Covers exactly the primitives
/// [`crate::storage::Storage`] and [`crate::renewer::PriorityAuthRenewer`]
/// need (SPEC_FULL.md §4.7) — nothing more.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<(), KvError>;
    async fn sadd(&self, set_key: &str, member: &str) -> Result<(), KvError>;
    async fn scard(&self, set_key: &str) -> Result<u64, KvError>;
    /// Atomically move `from` to `to`. MUST fail rather than silently
    /// overwrite an existing `to` key — the flush protocol's no-overwrite
    /// invariant depends on that.
    async fn rename(&self, from: &str, to: &str) -> Result<(), KvError>;
    async fn smembers(&self, set_key: &str) -> Result<Vec<String>, KvError>;
    async fn delete(&self, keys: &[String]) -> Result<(), KvError>;
    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError>;
}

/// Redis-backed [`KvStore`], mirroring the `ConnectionManager` usage already
/// present in `integration-gateway`'s `RedisRateLimiter`. Publishing and
/// incrementing commands share one auto-reconnecting connection manager;
/// `subscribe` opens its own dedicated connection, because a connection in
/// subscribe mode cannot issue other commands (SPEC_FULL.md §5).
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
    client: redis::Client,
}

impl RedisKvStore {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { manager, client })
    }

    fn command_err(err: redis::RedisError) -> KvError {
        KvError::Command(err.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();
        let _: () = conn.hset_multiple(key, &items).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(Self::command_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: () = conn.expire(key, ttl_secs as i64).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: i64 = conn.hincr(key, field, delta).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn sadd(&self, set_key: &str, member: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: i64 = conn.sadd(set_key, member).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn scard(&self, set_key: &str) -> Result<u64, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.scard(set_key).await.map_err(Self::command_err)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        // RENAMENX errors would be swallowed as a plain "0" by rename_nx; we
        // check existence first so a collision surfaces as a real error
        // instead of silently discarding `to`'s previous contents.
        let renamed: bool = conn.rename_nx(from, to).await.map_err(Self::command_err)?;
        if !renamed {
            return Err(KvError::RenameCollision(to.to_string()));
        }
        Ok(())
    }

    async fn smembers(&self, set_key: &str) -> Result<Vec<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.smembers(set_key).await.map_err(Self::command_err)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        use redis::AsyncCommands;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: u64 = conn.del(keys).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: i64 = conn.publish(channel, message).await.map_err(Self::command_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
        use futures_util::StreamExt;

        let connection = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        let mut pubsub = connection.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(Self::command_err)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}

/// In-memory [`KvStore`], in the same spirit as `integration-gateway`'s
/// `InMemoryRateLimiter`: used in every test, no network involved.
/// `tokio::sync::broadcast` gives the same "late subscribers miss messages"
/// semantics as a real pub/sub primitive.
pub mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::{broadcast, Mutex};

    #[derive(Default)]
    struct State {
        hashes: HashMap<String, HashMap<String, String>>,
        ttls: HashMap<String, u64>,
        sets: HashMap<String, HashSet<String>>,
        channels: HashMap<String, broadcast::Sender<String>>,
    }

    pub struct InMemoryKvStore {
        state: Arc<Mutex<State>>,
    }

    impl InMemoryKvStore {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(State::default())),
            }
        }

        fn channel_sender(state: &mut State, channel: &str) -> broadcast::Sender<String> {
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(256).0)
                .clone()
        }

        pub async fn ttl_of(&self, key: &str) -> Option<u64> {
            self.state.lock().await.ttls.get(key).copied()
        }
    }

    #[async_trait]
    impl KvStore for InMemoryKvStore {
        async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            let entry = state.hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                entry.insert(field.clone(), value.clone());
            }
            Ok(())
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
            let state = self.state.lock().await;
            Ok(state.hashes.get(key).cloned().unwrap_or_default())
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            state.ttls.insert(key.to_string(), ttl_secs);
            Ok(())
        }

        async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            let entry = state.hashes.entry(key.to_string()).or_default();
            let current: i64 = entry.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
            entry.insert(field.to_string(), (current + delta).to_string());
            Ok(())
        }

        async fn sadd(&self, set_key: &str, member: &str) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            state
                .sets
                .entry(set_key.to_string())
                .or_default()
                .insert(member.to_string());
            Ok(())
        }

        async fn scard(&self, set_key: &str) -> Result<u64, KvError> {
            let state = self.state.lock().await;
            Ok(state.sets.get(set_key).map(|s| s.len() as u64).unwrap_or(0))
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            if state.sets.contains_key(to) || state.hashes.contains_key(to) {
                return Err(KvError::RenameCollision(to.to_string()));
            }
            let moved_set = state.sets.remove(from);
            let moved_hash = state.hashes.remove(from);
            if moved_set.is_none() && moved_hash.is_none() {
                return Err(KvError::Command(format!("no such key: {from}")));
            }
            if let Some(set) = moved_set {
                state.sets.insert(to.to_string(), set);
            }
            if let Some(hash) = moved_hash {
                state.hashes.insert(to.to_string(), hash);
            }
            Ok(())
        }

        async fn smembers(&self, set_key: &str) -> Result<Vec<String>, KvError> {
            let state = self.state.lock().await;
            Ok(state
                .sets
                .get(set_key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            for key in keys {
                state.sets.remove(key);
                state.hashes.remove(key);
                state.ttls.remove(key);
            }
            Ok(())
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
            let mut state = self.state.lock().await;
            let sender = Self::channel_sender(&mut state, channel);
            // No subscribers is not an error: a broadcast publish with zero
            // receivers is exactly the "best-effort, no replay" semantics
            // the spec assumes for this primitive.
            let _ = sender.send(message.to_string());
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
            let mut state = self.state.lock().await;
            let sender = Self::channel_sender(&mut state, channel);
            drop(state);
            let mut broadcast_rx = sender.subscribe();
            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(async move {
                loop {
                    match broadcast_rx.recv().await {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(Subscription::new(rx))
        }
    }

    /// Wraps another [`KvStore`] and can be told to fail specific operations
    /// on demand, so tests can exercise the failure-recovery paths
    /// `InMemoryKvStore` alone has no way to trigger: a cache write that
    /// fails, a publish that fails, or one `rename` in a multi-key batch
    /// failing while its siblings succeed.
    pub struct FailingKvStore {
        inner: Arc<dyn KvStore>,
        fail_hset_many: Mutex<u32>,
        fail_publish: Mutex<u32>,
        fail_rename_from: Mutex<HashSet<String>>,
    }

    impl FailingKvStore {
        pub fn new(inner: Arc<dyn KvStore>) -> Self {
            Self {
                inner,
                fail_hset_many: Mutex::new(0),
                fail_publish: Mutex::new(0),
                fail_rename_from: Mutex::new(HashSet::new()),
            }
        }

        /// The next `times` calls to `hset_many` fail before reaching the
        /// inner store.
        pub async fn fail_next_hset_many(&self, times: u32) {
            *self.fail_hset_many.lock().await = times;
        }

        /// The next `times` calls to `publish` fail before reaching the
        /// inner store.
        pub async fn fail_next_publish(&self, times: u32) {
            *self.fail_publish.lock().await = times;
        }

        /// The next `rename` call whose `from` argument equals `key` fails;
        /// consumed after one use.
        pub async fn fail_rename_from(&self, key: &str) {
            self.fail_rename_from.lock().await.insert(key.to_string());
        }
    }

    #[async_trait]
    impl KvStore for FailingKvStore {
        async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
            let mut remaining = self.fail_hset_many.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KvError::Command("injected hset_many failure".to_string()));
            }
            drop(remaining);
            self.inner.hset_many(key, fields).await
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
            self.inner.hgetall(key).await
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
            self.inner.expire(key, ttl_secs).await
        }

        async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<(), KvError> {
            self.inner.hincrby(key, field, delta).await
        }

        async fn sadd(&self, set_key: &str, member: &str) -> Result<(), KvError> {
            self.inner.sadd(set_key, member).await
        }

        async fn scard(&self, set_key: &str) -> Result<u64, KvError> {
            self.inner.scard(set_key).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), KvError> {
            let mut failing = self.fail_rename_from.lock().await;
            if failing.remove(from) {
                return Err(KvError::Command(format!("injected rename failure for {from}")));
            }
            drop(failing);
            self.inner.rename(from, to).await
        }

        async fn smembers(&self, set_key: &str) -> Result<Vec<String>, KvError> {
            self.inner.smembers(set_key).await
        }

        async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
            self.inner.delete(keys).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
            let mut remaining = self.fail_publish.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KvError::Command("injected publish failure".to_string()));
            }
            drop(remaining);
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
            self.inner.subscribe(channel).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FailingKvStore, InMemoryKvStore};
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn rename_fails_on_collision_instead_of_overwriting() {
        let kv = InMemoryKvStore::new();
        kv.sadd("a", "x").await.unwrap();
        kv.sadd("b", "y").await.unwrap();
        let err = kv.rename("a", "b").await.unwrap_err();
        assert!(matches!(err, KvError::RenameCollision(_)));
        // "b" must be untouched.
        let members = kv.smembers("b").await.unwrap();
        assert_eq!(members, vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn publish_then_subscribe_misses_the_message() {
        let kv = InMemoryKvStore::new();
        kv.publish("chan", "hello").await.unwrap();
        let mut sub = kv.subscribe("chan").await.unwrap();
        kv.publish("chan", "world").await.unwrap();
        let received = sub.recv().await;
        assert_eq!(received, Some("world".to_string()));
    }

    #[tokio::test]
    async fn hincrby_accumulates() {
        let kv = InMemoryKvStore::new();
        kv.hincrby("report:a", "hits", 5).await.unwrap();
        kv.hincrby("report:a", "hits", 3).await.unwrap();
        let all = kv.hgetall("report:a").await.unwrap();
        assert_eq!(all.get("hits"), Some(&"8".to_string()));
    }

    #[tokio::test]
    async fn failing_kv_store_fails_exactly_the_configured_number_of_times() {
        let kv = FailingKvStore::new(Arc::new(InMemoryKvStore::new()));
        kv.fail_next_hset_many(2).await;
        assert!(kv.hset_many("k", &[("f".into(), "v".into())]).await.is_err());
        assert!(kv.hset_many("k", &[("f".into(), "v".into())]).await.is_err());
        assert!(kv.hset_many("k", &[("f".into(), "v".into())]).await.is_ok());
    }

    #[tokio::test]
    async fn failing_kv_store_only_fails_the_targeted_rename() {
        let kv = FailingKvStore::new(Arc::new(InMemoryKvStore::new()));
        kv.sadd("keep", "x").await.unwrap();
        kv.sadd("drop", "y").await.unwrap();
        kv.fail_rename_from("drop").await;

        assert!(kv.rename("drop", "drop2").await.is_err());
        kv.rename("keep", "keep2").await.unwrap();

        // Failure is consumed after one use; a second attempt succeeds.
        kv.rename("drop", "drop2").await.unwrap();
    }
}
