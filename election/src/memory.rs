//! Single-process coordination service.
//!
//! Every mutation runs under one lock and fans out to watchers before the
//! lock is released, so events are totally ordered by revision. Client
//! handles are named so tests can partition one participant from the
//! service or inject transient failures into its next calls. A partition
//! also closes the client's open subscriptions, as a broken connection would.

use crate::service::{
    ClaimOutcome, CoordinationService, KeyValue, LeaseId, Snapshot, Subscription, WatchEvent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

const HISTORY_LIMIT: usize = 4096;
const REAPER_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default)]
pub struct InMemoryService {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    keyspace: Mutex<Keyspace>,
    partitions: DashMap<String, ()>,
    pending_failures: DashMap<String, usize>,
    reaper_started: AtomicBool,
}

#[derive(Debug, Default)]
struct Keyspace {
    revision: i64,
    next_lease: i64,
    keys: HashMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: HashMap<Uuid, Registration>,
    history: VecDeque<WatchEvent>,
    /// Newest revision dropped from `history`.
    compacted: i64,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct Registration {
    client: String,
    key: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

impl Keyspace {
    fn emit(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        if self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }

        // Receivers that were cancelled or dropped are pruned here.
        self.watchers
            .retain(|_, reg| reg.key != event.key || reg.tx.send(Ok(event.clone())).is_ok());
    }

    fn delete_key(&mut self, key: &str) -> Option<KeyValue> {
        let kv = self.keys.remove(key)?;
        if let Some(record) = kv.lease.and_then(|lease| self.leases.get_mut(&lease)) {
            record.keys.remove(key);
        }
        self.revision += 1;
        let revision = self.revision;
        self.emit(WatchEvent::deleted(key, revision));
        Some(kv)
    }

    fn revoke(&mut self, lease: LeaseId) -> bool {
        let Some(record) = self.leases.remove(&lease) else {
            return false;
        };
        let mut keys: Vec<_> = record.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete_key(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(%lease, "lease expired");
            self.revoke(lease);
        }
    }
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a client handle; `name` is what fault injection targets.
    pub fn connect(&self, name: &str) -> InMemoryClient {
        InMemoryClient {
            name: name.to_string(),
            inner: self.inner.clone(),
        }
    }

    /// Every call from `name` fails with `Unavailable` until healed, and its
    /// open subscriptions are closed.
    pub fn partition(&self, name: &str) {
        self.inner.partitions.insert(name.to_string(), ());
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.watchers.retain(|_, reg| reg.client != name);
        debug!(client = name, "partitioned");
    }

    pub fn heal(&self, name: &str) {
        self.inner.partitions.remove(name);
    }

    /// The next `count` calls from `name` fail with `Unavailable`.
    pub fn fail_next(&self, name: &str, count: usize) {
        self.inner.pending_failures.insert(name.to_string(), count);
    }

    /// Revokes a lease on the service side, as if its holder died and the TTL ran out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.keyspace.lock().revoke(lease)
    }

    pub fn value_of(&self, key: &str) -> Option<String> {
        self.inner.keyspace.lock().keys.get(key).map(|kv| kv.value.clone())
    }

    pub fn lease_count(&self) -> usize {
        self.inner.keyspace.lock().leases.len()
    }

    pub fn lease_exists(&self, lease: LeaseId) -> bool {
        self.inner.keyspace.lock().leases.contains_key(&lease)
    }

    pub fn watcher_count(&self) -> usize {
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.watchers.retain(|_, reg| !reg.tx.is_closed());
        keyspace.watchers.len()
    }

    pub fn revision(&self) -> i64 {
        self.inner.keyspace.lock().revision
    }

    /// Discards all retained history; replays from before now fail with `Compacted`.
    pub fn compact(&self) {
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.history.clear();
        keyspace.compacted = keyspace.revision;
    }

    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.keyspace.lock().expire(Instant::now());
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryClient {
    name: String,
    inner: Arc<Inner>,
}

impl InMemoryClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_reachable(&self) -> Result<()> {
        if self.inner.partitions.contains_key(&self.name) {
            return Err(Error::Unavailable(format!("{} is partitioned", self.name)));
        }
        if let Some(mut remaining) = self.inner.pending_failures.get_mut(&self.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Unavailable("injected failure".to_string()));
            }
        }
        Ok(())
    }

    fn service(&self) -> InMemoryService {
        InMemoryService {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl CoordinationService for InMemoryClient {
    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_reachable()?;
        if ttl.is_zero() {
            return Err(Error::Config("lease ttl must be positive".to_string()));
        }
        self.service().ensure_reaper();

        let mut keyspace = self.inner.keyspace.lock();
        keyspace.next_lease += 1;
        let lease = LeaseId(keyspace.next_lease);
        keyspace.leases.insert(
            lease,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        trace!(client = %self.name, %lease, ?ttl, "granted lease");
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.expire(now);
        let record = keyspace
            .leases
            .get_mut(&lease)
            .ok_or(Error::LeaseNotFound { lease })?;
        record.deadline = now + record.ttl;
        Ok(record.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check_reachable()?;
        let revoked = self.inner.keyspace.lock().revoke(lease);
        trace!(client = %self.name, %lease, revoked, "revoke lease");
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &str, lease: LeaseId) -> Result<ClaimOutcome> {
        self.check_reachable()?;
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.expire(Instant::now());

        if !keyspace.leases.contains_key(&lease) {
            return Err(Error::LeaseNotFound { lease });
        }

        if let Some(existing) = keyspace.keys.get(key) {
            return Ok(ClaimOutcome {
                created: false,
                current_value: existing.value.clone(),
                revision: keyspace.revision,
            });
        }

        keyspace.revision += 1;
        let revision = keyspace.revision;
        keyspace.keys.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                lease: Some(lease),
                create_revision: revision,
                mod_revision: revision,
            },
        );
        if let Some(record) = keyspace.leases.get_mut(&lease) {
            record.keys.insert(key.to_string());
        }
        keyspace.emit(WatchEvent::created(key, value, revision));

        Ok(ClaimOutcome {
            created: true,
            current_value: value.to_string(),
            revision,
        })
    }

    async fn get(&self, key: &str) -> Result<Snapshot> {
        self.check_reachable()?;
        let mut keyspace = self.inner.keyspace.lock();
        keyspace.expire(Instant::now());
        Ok(Snapshot {
            value: keyspace.keys.get(key).cloned(),
            revision: keyspace.revision,
        })
    }

    async fn watch(&self, key: &str, start_revision: Option<i64>) -> Result<Subscription> {
        self.check_reachable()?;
        let (tx, subscription) = Subscription::channel(key);
        let mut keyspace = self.inner.keyspace.lock();
        // Re-checked under the lock so a concurrent partition cannot miss this registration.
        if self.inner.partitions.contains_key(&self.name) {
            return Err(Error::Unavailable(format!("{} is partitioned", self.name)));
        }

        if let Some(start) = start_revision {
            if start <= keyspace.compacted {
                return Err(Error::Compacted {
                    compact_revision: keyspace.compacted + 1,
                });
            }
            for event in keyspace
                .history
                .iter()
                .filter(|event| event.key == key && event.revision >= start)
            {
                let _ = tx.send(Ok(event.clone()));
            }
        }

        keyspace.watchers.insert(
            Uuid::new_v4(),
            Registration {
                client: self.name.clone(),
                key: key.to_string(),
                tx,
            },
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EventAction;

    const KEY: &str = "MyApp/leader";

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let service = InMemoryService::new();
        let a = service.connect("a");
        let b = service.connect("b");

        let lease_a = a.create_lease(Duration::from_secs(10)).await.unwrap();
        let lease_b = b.create_lease(Duration::from_secs(10)).await.unwrap();
        assert_ne!(lease_a, lease_b);

        let first = a.create_if_absent(KEY, "a", lease_a).await.unwrap();
        assert!(first.created);
        assert_eq!(first.current_value, "a");

        let second = b.create_if_absent(KEY, "b", lease_b).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.current_value, "a");
        assert_eq!(second.revision, first.revision);
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_notifies() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let lease = client.create_lease(Duration::from_secs(10)).await.unwrap();
        let mut events = client.watch(KEY, None).await.unwrap();

        client.create_if_absent(KEY, "a", lease).await.unwrap();
        client.revoke_lease(lease).await.unwrap();

        let created = events.next().await.unwrap().unwrap();
        assert_eq!(created.action, EventAction::Created);
        assert_eq!(created.value.as_deref(), Some("a"));

        let deleted = events.next().await.unwrap().unwrap();
        assert_eq!(deleted.action, EventAction::Deleted);
        assert!(deleted.revision > created.revision);

        assert_eq!(service.value_of(KEY), None);
        assert!(!service.lease_exists(lease));
    }

    #[tokio::test]
    async fn test_claim_with_unknown_lease_fails() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let err = client
            .create_if_absent(KEY, "a", LeaseId(42))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound { lease: LeaseId(42) }));
        assert_eq!(service.value_of(KEY), None);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let lease = client.create_lease(Duration::from_secs(10)).await.unwrap();

        let claim = client.create_if_absent(KEY, "a", lease).await.unwrap();
        client.revoke_lease(lease).await.unwrap();

        // Starting after the claim skips the creation but sees the deletion.
        let mut events = client.watch(KEY, Some(claim.revision + 1)).await.unwrap();
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.action, EventAction::Deleted);
        assert_eq!(event.revision, claim.revision + 1);
    }

    #[tokio::test]
    async fn test_unrenewed_lease_expires() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let lease = client.create_lease(Duration::from_millis(50)).await.unwrap();
        let mut events = client.watch(KEY, None).await.unwrap();
        client.create_if_absent(KEY, "a", lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!service.lease_exists(lease));
        assert_eq!(events.next().await.unwrap().unwrap().action, EventAction::Created);
        assert_eq!(events.next().await.unwrap().unwrap().action, EventAction::Deleted);
        assert!(matches!(
            client.keep_alive(lease).await,
            Err(Error::LeaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_extends_deadline() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let lease = client.create_lease(Duration::from_millis(150)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(client.keep_alive(lease).await.unwrap(), Duration::from_millis(150));
        }
        assert!(service.lease_exists(lease));
    }

    #[tokio::test]
    async fn test_partition_and_injected_failures() {
        let service = InMemoryService::new();
        let a = service.connect("a");
        let b = service.connect("b");

        service.partition("a");
        assert!(matches!(a.get(KEY).await, Err(Error::Unavailable(_))));
        assert!(b.get(KEY).await.is_ok());
        service.heal("a");
        assert!(a.get(KEY).await.is_ok());

        service.fail_next("b", 2);
        assert!(b.get(KEY).await.is_err());
        assert!(b.get(KEY).await.is_err());
        assert!(b.get(KEY).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_closes_open_subscriptions() {
        let service = InMemoryService::new();
        let a = service.connect("a");
        let b = service.connect("b");
        let mut events = a.watch(KEY, None).await.unwrap();

        service.partition("a");
        let lease = b.create_lease(Duration::from_secs(10)).await.unwrap();
        b.create_if_absent(KEY, "b", lease).await.unwrap();

        assert!(events.next().await.is_none());
        assert!(matches!(a.watch(KEY, None).await, Err(Error::Unavailable(_))));

        // After healing, a replay from before the partition catches up.
        service.heal("a");
        let mut events = a.watch(KEY, Some(1)).await.unwrap();
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.action, EventAction::Created);
        assert_eq!(event.value.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_replay_from_compacted_revision_fails() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let lease = client.create_lease(Duration::from_secs(10)).await.unwrap();
        let claim = client.create_if_absent(KEY, "a", lease).await.unwrap();

        service.compact();

        assert!(matches!(
            client.watch(KEY, Some(claim.revision)).await,
            Err(Error::Compacted { compact_revision }) if compact_revision == claim.revision + 1
        ));
        assert!(client.watch(KEY, Some(claim.revision + 1)).await.is_ok());
        assert!(client.watch(KEY, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_pruned() {
        let service = InMemoryService::new();
        let client = service.connect("a");
        let mut subscription = client.watch(KEY, None).await.unwrap();
        assert_eq!(service.watcher_count(), 1);

        subscription.cancel();
        subscription.cancel();
        assert_eq!(service.watcher_count(), 0);
    }
}
