//! Capability contract consumed from the coordination service.
//!
//! Only four primitives are needed: leases, lease-bound conditional create,
//! plain reads and ordered change notifications on a key. Implementations
//! live in [`crate::memory`] and, with the `etcd` feature, `crate::etcd`.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Opaque lease handle issued by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

/// A read of one key together with the service revision it was taken at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub value: Option<KeyValue>,
    pub revision: i64,
}

/// Result of an atomic create-if-absent.
///
/// When `created` is false, `current_value` is the value already stored
/// under the key (the incumbent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub created: bool,
    pub current_value: String,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: EventAction,
    pub key: String,
    pub value: Option<String>,
    pub revision: i64,
}

impl WatchEvent {
    pub fn created(key: &str, value: &str, revision: i64) -> Self {
        Self {
            action: EventAction::Created,
            key: key.to_string(),
            value: Some(value.to_string()),
            revision,
        }
    }

    pub fn updated(key: &str, value: &str, revision: i64) -> Self {
        Self {
            action: EventAction::Updated,
            key: key.to_string(),
            value: Some(value.to_string()),
            revision,
        }
    }

    pub fn deleted(key: &str, revision: i64) -> Self {
        Self {
            action: EventAction::Deleted,
            key: key.to_string(),
            value: None,
            revision,
        }
    }
}

/// A live subscription to changes on one key.
///
/// Events arrive in the order the service applied them. The service may end
/// the stream with an error, e.g. `Error::Compacted` when the requested
/// start revision is no longer available. Cancelling closes the channel;
/// the service side notices on its next send (or, for forwarding tasks,
/// through `UnboundedSender::closed`).
#[derive(Debug)]
pub struct Subscription {
    key: String,
    events: mpsc::UnboundedReceiver<Result<WatchEvent>>,
}

impl Subscription {
    pub fn new(key: impl Into<String>, events: mpsc::UnboundedReceiver<Result<WatchEvent>>) -> Self {
        Self {
            key: key.into(),
            events,
        }
    }

    /// Creates a connected sender/subscription pair for service implementations.
    pub fn channel(key: impl Into<String>) -> (mpsc::UnboundedSender<Result<WatchEvent>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(key, rx))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event, or `None` once the service side has gone away.
    pub async fn next(&mut self) -> Option<Result<WatchEvent>> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        self.events.close();
    }
}

#[async_trait]
pub trait CoordinationService: Send + Sync + fmt::Debug {
    /// Grants a lease that lives for `ttl` unless kept alive.
    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renews the lease once, returning the TTL the service granted.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration>;

    /// Revokes the lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Atomically creates `key = value` bound to `lease` if the key does not exist.
    async fn create_if_absent(&self, key: &str, value: &str, lease: LeaseId) -> Result<ClaimOutcome>;

    async fn get(&self, key: &str) -> Result<Snapshot>;

    /// Subscribes to changes on `key`, replaying from `start_revision` when given.
    ///
    /// Fails with `Error::Compacted` (here or in-stream) when `start_revision`
    /// is older than the retained history.
    async fn watch(&self, key: &str, start_revision: Option<i64>) -> Result<Subscription>;
}
