use crate::{
    error::{Error, Result},
    service::{CoordinationService, LeaseId},
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

impl Lease {
    /// Renewal cadence: three renewals per TTL window.
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_RENEW_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Alive,
    Lost { failures: u32 },
}

#[derive(Debug)]
struct ActiveLease {
    lease: Lease,
    status: Arc<Mutex<LeaseStatus>>,
    keeper: JoinHandle<()>,
}

/// Owns at most one lease and keeps it alive in the background.
///
/// A lease is declared lost once renewals have failed `renewal_failure_limit`
/// times in a row, or earlier when the next renewal could only land after
/// the service-side expiry. Losses are announced on [`LeaseManager::losses`].
#[derive(Debug)]
pub struct LeaseManager {
    service: Arc<dyn CoordinationService>,
    renewal_failure_limit: u32,
    active: tokio::sync::Mutex<Option<ActiveLease>>,
    grants: AtomicU64,
    losses: Arc<watch::Sender<Option<LeaseId>>>,
}

impl LeaseManager {
    pub fn new(service: Arc<dyn CoordinationService>, renewal_failure_limit: u32) -> Self {
        Self {
            service,
            renewal_failure_limit: renewal_failure_limit.max(1),
            active: tokio::sync::Mutex::new(None),
            grants: AtomicU64::new(0),
            losses: Arc::new(watch::channel(None).0),
        }
    }

    /// Receiver that changes to `Some(lease)` each time a lease is lost.
    pub fn losses(&self) -> watch::Receiver<Option<LeaseId>> {
        self.losses.subscribe()
    }

    /// Returns the live lease, granting one first if there is none.
    ///
    /// A lease whose renewals failed is reported once as `LeaseExpired` and
    /// then forgotten, so the following call grants a fresh lease.
    pub async fn acquire(&self, ttl: Duration) -> Result<Lease> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            let status = *current.status.lock();
            match status {
                LeaseStatus::Alive => return Ok(current.lease),
                LeaseStatus::Lost { failures } => {
                    let lease = current.lease.id;
                    if let Some(lost) = active.take() {
                        lost.keeper.abort();
                    }
                    return Err(Error::LeaseExpired { lease, failures });
                }
            }
        }

        let requested = Instant::now();
        let id = self.service.create_lease(ttl).await?;
        self.grants.fetch_add(1, Ordering::SeqCst);
        let lease = Lease { id, ttl };
        let status = Arc::new(Mutex::new(LeaseStatus::Alive));
        let keeper = tokio::spawn(keep_alive(
            self.service.clone(),
            lease,
            requested,
            Keeper {
                status: status.clone(),
                losses: self.losses.clone(),
                failure_limit: self.renewal_failure_limit,
            },
        ));
        info!(lease = %id, ?ttl, "acquired lease");

        *active = Some(ActiveLease {
            lease,
            status,
            keeper,
        });
        Ok(lease)
    }

    pub async fn current(&self) -> Option<Lease> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|a| *a.status.lock() == LeaseStatus::Alive)
            .map(|a| a.lease)
    }

    pub async fn status(&self) -> Option<LeaseStatus> {
        let active = self.active.lock().await;
        active.as_ref().map(|a| *a.status.lock())
    }

    /// Forgets the current lease without revoking it.
    pub async fn invalidate(&self) {
        if let Some(stale) = self.active.lock().await.take() {
            stale.keeper.abort();
            debug!(lease = %stale.lease.id, "dropped stale lease");
        }
    }

    /// Stops renewal and revokes the lease, deleting every key bound to it.
    pub async fn cancel(&self) -> Result<()> {
        let Some(active) = self.active.lock().await.take() else {
            return Ok(());
        };
        active.keeper.abort();
        self.service.revoke_lease(active.lease.id).await?;
        info!(lease = %active.lease.id, "revoked lease");
        Ok(())
    }

    /// Stops renewal without contacting the service; the lease then expires.
    pub fn abandon(&self) {
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(active) = active.take() {
                active.keeper.abort();
            }
        }
    }

    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::SeqCst)
    }
}

struct Keeper {
    status: Arc<Mutex<LeaseStatus>>,
    losses: Arc<watch::Sender<Option<LeaseId>>>,
    failure_limit: u32,
}

impl Keeper {
    fn lost(&self, lease: LeaseId, failures: u32) {
        *self.status.lock() = LeaseStatus::Lost { failures };
        self.losses.send_replace(Some(lease));
    }
}

/// Renews `lease` until it is lost. `renewed` is when the last successful
/// request was sent; the service keeps the lease at least `ttl` past it.
async fn keep_alive(
    service: Arc<dyn CoordinationService>,
    lease: Lease,
    mut renewed: Instant,
    keeper: Keeper,
) {
    let period = lease.renew_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; the lease was just granted.
    interval.tick().await;

    let mut failures = 0;
    loop {
        interval.tick().await;
        let sent = Instant::now();
        match service.keep_alive(lease.id).await {
            Ok(_) => {
                failures = 0;
                renewed = sent;
            }
            Err(Error::LeaseNotFound { .. }) => {
                warn!(lease = %lease.id, "lease no longer exists on the service");
                keeper.lost(lease.id, failures + 1);
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(lease = %lease.id, failures, "lease renewal failed: {}", e);
                if failures >= keeper.failure_limit {
                    keeper.lost(lease.id, failures);
                    return;
                }
                if Instant::now() + period >= renewed + lease.ttl {
                    warn!(lease = %lease.id, failures, "lease expires before the next renewal");
                    keeper.lost(lease.id, failures);
                    return;
                }
            }
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.keeper.abort();
        }
    }
}
