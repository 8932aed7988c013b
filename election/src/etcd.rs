//! etcd v3 coordination service.
//!
//! The conditional create is a single transaction comparing the key's
//! create revision against zero, so the claim and the incumbent read are
//! one atomic server-side step.

use crate::service::{
    ClaimOutcome, CoordinationService, EventAction, KeyValue, LeaseId, Snapshot, Subscription,
    WatchEvent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions, WatchResponse,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EtcdService {
    endpoints: Vec<String>,
    client: Client,
    keepers: Mutex<HashMap<i64, (LeaseKeeper, LeaseKeepAliveStream)>>,
}

impl fmt::Debug for EtcdService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdService")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl EtcdService {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(DEFAULT_TIMEOUT)
            .with_timeout(DEFAULT_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self {
            endpoints: endpoints.to_vec(),
            client,
            keepers: Mutex::new(HashMap::new()),
        })
    }
}

/// etcd leases are granted in whole seconds.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn lease_error(e: etcd_client::Error, lease: LeaseId) -> Error {
    match &e {
        etcd_client::Error::GRpcStatus(status) if status.message().contains("lease not found") => {
            Error::LeaseNotFound { lease }
        }
        _ => e.into(),
    }
}

/// Why etcd cancelled a watch. A positive compact revision means the
/// requested start revision is gone.
fn cancellation(resp: &WatchResponse) -> Error {
    if resp.compact_revision() > 0 {
        warn!(compact_revision = resp.compact_revision(), "etcd watch start revision compacted");
        return Error::Compacted {
            compact_revision: resp.compact_revision(),
        };
    }
    warn!(reason = resp.cancel_reason(), "etcd cancelled the watch");
    Error::Unavailable(format!("watch cancelled: {}", resp.cancel_reason()))
}

fn convert(key: &str, event: &etcd_client::Event) -> WatchEvent {
    let kv = event.kv();
    let action = match event.event_type() {
        EventType::Put => match kv {
            Some(kv) if kv.create_revision() == kv.mod_revision() => EventAction::Created,
            _ => EventAction::Updated,
        },
        EventType::Delete => EventAction::Deleted,
    };
    WatchEvent {
        action,
        key: key.to_string(),
        value: kv
            .and_then(|kv| kv.value_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned),
        revision: kv.map_or(0, |kv| kv.mod_revision()),
    }
}

#[async_trait]
impl CoordinationService for EtcdService {
    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let resp = self.client.clone().lease_grant(ttl_secs(ttl), None).await?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let mut keepers = self.keepers.lock().await;
        let (keeper, stream) = match keepers.entry(lease.0) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let pair = self
                    .client
                    .clone()
                    .lease_keep_alive(lease.0)
                    .await
                    .map_err(|e| lease_error(e, lease))?;
                entry.insert(pair)
            }
        };

        let reply = match keeper.keep_alive().await {
            Ok(()) => stream.message().await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(Some(resp)) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl().unsigned_abs())),
            Ok(Some(_)) => {
                keepers.remove(&lease.0);
                Err(Error::LeaseNotFound { lease })
            }
            Ok(None) => {
                keepers.remove(&lease.0);
                Err(Error::Unavailable("keep-alive stream closed".to_string()))
            }
            Err(e) => {
                keepers.remove(&lease.0);
                Err(lease_error(e, lease))
            }
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.keepers.lock().await.remove(&lease.0);
        match self.client.clone().lease_revoke(lease.0).await {
            Ok(_) => Ok(()),
            Err(e) => match lease_error(e, lease) {
                Error::LeaseNotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create_if_absent(&self, key: &str, value: &str, lease: LeaseId) -> Result<ClaimOutcome> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease.0)),
            )])
            .or_else(vec![TxnOp::get(key, None)]);

        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| lease_error(e, lease))?;
        let revision = resp.header().map_or(0, |h| h.revision());

        if resp.succeeded() {
            return Ok(ClaimOutcome {
                created: true,
                current_value: value.to_string(),
                revision,
            });
        }

        let incumbent = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| kv.value_str().map(str::to_owned)),
            _ => None,
        });
        match incumbent {
            Some(current_value) => Ok(ClaimOutcome {
                created: false,
                current_value: current_value?,
                revision,
            }),
            None => Err(Error::Unavailable(format!(
                "{} failed its create comparison but has no value",
                key
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<Snapshot> {
        let resp = self.client.clone().get(key, None).await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let value = match resp.kvs().first() {
            Some(kv) => Some(KeyValue {
                key: kv.key_str()?.to_string(),
                value: kv.value_str()?.to_string(),
                lease: (kv.lease() != 0).then(|| LeaseId(kv.lease())),
                create_revision: kv.create_revision(),
                mod_revision: kv.mod_revision(),
            }),
            None => None,
        };
        Ok(Snapshot { value, revision })
    }

    async fn watch(&self, key: &str, start_revision: Option<i64>) -> Result<Subscription> {
        let options = start_revision.map(|rev| WatchOptions::new().with_start_revision(rev));
        let (mut watcher, mut stream) = self.client.clone().watch(key, options).await?;
        let (tx, subscription) = Subscription::channel(key);
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        if let Err(e) = watcher.cancel().await {
                            debug!(key = %key, "cancelling etcd watch: {}", e);
                        }
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                let _ = tx.send(Err(cancellation(&resp)));
                                break;
                            }
                            for event in resp.events() {
                                if tx.send(Ok(convert(&key, event))).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(key = %key, "etcd watch stream failed: {}", e);
                            let _ = tx.send(Err(e.into()));
                            break;
                        }
                    }
                }
            }
        });

        Ok(subscription)
    }
}
