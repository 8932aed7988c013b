//! The election state machine.
//!
//! Known leader state is published through a `watch` channel so accessors
//! never block. Every transition (claim attempt, change notification,
//! confirmation read) runs under one async mutex, which keeps a
//! notification-driven re-election from interleaving with a manual attempt.

use crate::{
    config::{ElectionConfig, RetryPolicy},
    error::{Error, Result},
    lease::LeaseManager,
    service::{CoordinationService, EventAction, LeaseId, WatchEvent},
    ParticipantId,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No leader is known, either before the first election or while the key is vacant.
    Unknown,
    Following,
    Leading,
}

/// Local belief about who leads, stamped with the service revision it reflects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leadership {
    pub leader: Option<ParticipantId>,
    pub revision: i64,
}

impl Leadership {
    pub fn role_of(&self, id: &ParticipantId) -> Role {
        match &self.leader {
            None => Role::Unknown,
            Some(leader) if leader == id => Role::Leading,
            Some(_) => Role::Following,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub role: Role,
    /// `None` when the key is held with an empty value.
    pub leader: Option<ParticipantId>,
    pub revision: i64,
}

/// Receives change events for the election key.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, event: WatchEvent) -> Result<()>;

    /// Rebuilds state from a fresh read after events were lost, returning
    /// the revision that state now reflects.
    async fn resync(&self) -> Result<i64>;
}

fn leader_from(value: String) -> Option<ParticipantId> {
    (!value.is_empty()).then(|| ParticipantId::from_service(value))
}

#[derive(Debug)]
pub struct Elector {
    id: ParticipantId,
    key: String,
    lease_ttl: Duration,
    retry: RetryPolicy,
    service: Arc<dyn CoordinationService>,
    leases: Arc<LeaseManager>,
    transition: Mutex<()>,
    state: watch::Sender<Leadership>,
    claim_attempts: AtomicU64,
}

impl Elector {
    pub fn new(
        id: ParticipantId,
        config: &ElectionConfig,
        service: Arc<dyn CoordinationService>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        let (state, _) = watch::channel(Leadership::default());
        Self {
            id,
            key: config.key.clone(),
            lease_ttl: config.lease_ttl(),
            retry: config.retry.clone(),
            service,
            leases,
            transition: Mutex::new(()),
            state,
            claim_attempts: AtomicU64::new(0),
        }
    }

    pub fn self_id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leading
    }

    pub fn current_leader_id(&self) -> Option<ParticipantId> {
        self.state.borrow().leader.clone()
    }

    pub fn role(&self) -> Role {
        self.state.borrow().role_of(&self.id)
    }

    pub fn leadership(&self) -> Leadership {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.state.subscribe()
    }

    /// Number of create-if-absent round trips issued so far.
    pub fn claim_attempts(&self) -> u64 {
        self.claim_attempts.load(Ordering::SeqCst)
    }

    /// Tries to claim the election key, retrying transient failures.
    ///
    /// On exhaustion the known leader is reset to unknown and
    /// `Error::ElectionFailed` is returned.
    pub async fn attempt_election(&self) -> Result<ElectionOutcome> {
        let _transition = self.transition.lock().await;
        self.claim().await
    }

    /// Re-reads the election key, re-entering the election if it is vacant.
    pub async fn confirm_leadership(&self) -> Result<Role> {
        let _transition = self.transition.lock().await;
        self.confirm().await
    }

    /// Forgets the known leader after our lease was lost, then re-reads the
    /// key. If the service is unreachable the state stays unknown.
    pub async fn step_down(&self, lease: LeaseId) -> Result<Role> {
        let _transition = self.transition.lock().await;
        if self.is_leader() {
            warn!(id = %self.id, %lease, "lease lost while leading, stepping down");
        } else {
            info!(id = %self.id, %lease, "lease lost");
        }
        self.vacate();
        self.confirm().await
    }

    async fn confirm(&self) -> Result<Role> {
        let snapshot = self.service.get(&self.key).await?;
        match snapshot.value {
            Some(kv) => {
                self.publish(leader_from(kv.value), snapshot.revision);
                Ok(self.role())
            }
            None => {
                debug!(key = %self.key, "election key vacant on confirmation");
                self.publish(None, snapshot.revision);
                self.claim().await.map(|outcome| outcome.role)
            }
        }
    }

    /// Resets local state to unknown; used at teardown.
    pub fn vacate(&self) {
        let revision = self.state.borrow().revision;
        self.publish(None, revision);
    }

    async fn claim(&self) -> Result<ElectionOutcome> {
        let mut delays = self.retry.delays();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_claim().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(id = %self.id, attempt, "election attempt failed: {}", e);
                    if e.invalidates_lease() {
                        self.leases.invalidate().await;
                    }
                    if let Some(delay) = delays.next() {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(e) => {
                    error!(id = %self.id, attempt, "giving up on election: {}", e);
                    let revision = self.state.borrow().revision;
                    self.publish(None, revision);
                    return Err(Error::ElectionFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    async fn try_claim(&self) -> Result<ElectionOutcome> {
        let lease = self.leases.acquire(self.lease_ttl).await?;
        self.claim_attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .service
            .create_if_absent(&self.key, self.id.as_str(), lease.id)
            .await?;

        if outcome.created {
            info!(id = %self.id, key = %self.key, lease = %lease.id, "I am the leader");
        }
        let leader = leader_from(outcome.current_value);
        match &leader {
            Some(leader) => {
                info!(id = %self.id, leader = %leader, revision = outcome.revision, "leader observed");
            }
            None => warn!(id = %self.id, revision = outcome.revision, "election key held with an empty value"),
        }
        self.publish(leader.clone(), outcome.revision);

        Ok(ElectionOutcome {
            role: self.role(),
            leader,
            revision: outcome.revision,
        })
    }

    async fn handle_event(&self, event: WatchEvent) -> Result<()> {
        let known = self.state.borrow().revision;
        if event.revision != 0 && event.revision <= known {
            debug!(
                id = %self.id,
                revision = event.revision,
                known,
                "skipping superseded event"
            );
            return Ok(());
        }

        match event.action {
            EventAction::Deleted => {
                info!(id = %self.id, revision = event.revision, "leader key deleted, re-electing");
                self.publish(None, event.revision);
                self.claim().await.map(|_| ())
            }
            EventAction::Created | EventAction::Updated => match event.value.and_then(leader_from) {
                Some(leader) => {
                    info!(id = %self.id, leader = %leader, "Rx leader");
                    self.publish(Some(leader), event.revision);
                    Ok(())
                }
                None => {
                    warn!(id = %self.id, revision = event.revision, "ignoring change event without a value");
                    Ok(())
                }
            },
            EventAction::Unknown(kind) => {
                warn!(id = %self.id, kind = %kind, "ignoring unrecognised change event");
                Ok(())
            }
        }
    }

    fn publish(&self, leader: Option<ParticipantId>, revision: i64) {
        let next = Leadership { leader, revision };
        let was = self.state.borrow().role_of(&self.id);
        let now = next.role_of(&self.id);
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if was != now {
            debug!(id = %self.id, from = ?was, to = ?now, "role changed");
        }
    }
}

#[async_trait]
impl ChangeHandler for Elector {
    async fn on_change(&self, event: WatchEvent) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.handle_event(event).await
    }

    async fn resync(&self) -> Result<i64> {
        let _transition = self.transition.lock().await;
        self.confirm().await?;
        Ok(self.state.borrow().revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryService;

    const KEY: &str = "MyApp/leader";

    fn elector(service: &InMemoryService, name: &str) -> Elector {
        let client: Arc<dyn CoordinationService> = Arc::new(service.connect(name));
        let config = ElectionConfig::with_key(KEY);
        let leases = Arc::new(LeaseManager::new(client.clone(), 3));
        Elector::new(ParticipantId::new(name).unwrap(), &config, client, leases)
    }

    #[tokio::test]
    async fn test_first_claim_leads_second_follows() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        let b = elector(&service, "B");

        assert_eq!(a.role(), Role::Unknown);

        let outcome = a.attempt_election().await.unwrap();
        assert_eq!(outcome.role, Role::Leading);
        assert!(a.is_leader());
        assert_eq!(a.current_leader_id().unwrap().as_str(), "A");

        let outcome = b.attempt_election().await.unwrap();
        assert_eq!(outcome.role, Role::Following);
        assert_eq!(outcome.leader.unwrap().as_str(), "A");
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");

        service.fail_next("A", 4);
        let outcome = a.attempt_election().await.unwrap();

        assert_eq!(outcome.role, Role::Leading);
        assert_eq!(service.value_of(KEY).as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_reset_state() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        a.attempt_election().await.unwrap();
        assert!(a.is_leader());

        service.partition("A");
        let err = a.attempt_election().await.unwrap_err();

        assert!(matches!(err, Error::ElectionFailed { attempts: 10, .. }));
        assert_eq!(a.role(), Role::Unknown);
        assert_eq!(a.current_leader_id(), None);
    }

    #[tokio::test]
    async fn test_deletion_triggers_reelection() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        let b = elector(&service, "B");
        a.attempt_election().await.unwrap();
        let followed = b.attempt_election().await.unwrap();

        let lease = a.leases.current().await.unwrap();
        service.expire_lease(lease.id);
        b.on_change(WatchEvent::deleted(KEY, followed.revision + 1))
            .await
            .unwrap();

        assert!(b.is_leader());
        assert_eq!(service.value_of(KEY).as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_creation_event_updates_leader_without_claim() {
        let service = InMemoryService::new();
        let b = elector(&service, "B");

        b.on_change(WatchEvent::created(KEY, "C", 5)).await.unwrap();

        assert_eq!(b.current_leader_id().unwrap().as_str(), "C");
        assert_eq!(b.role(), Role::Following);
        assert_eq!(b.claim_attempts(), 0);
    }

    #[tokio::test]
    async fn test_superseded_events_are_skipped() {
        let service = InMemoryService::new();
        let b = elector(&service, "B");

        b.on_change(WatchEvent::created(KEY, "C", 8)).await.unwrap();
        b.on_change(WatchEvent::created(KEY, "OLD", 6)).await.unwrap();
        b.on_change(WatchEvent::deleted(KEY, 7)).await.unwrap();

        assert_eq!(b.current_leader_id().unwrap().as_str(), "C");
        assert_eq!(b.claim_attempts(), 0);
    }

    #[tokio::test]
    async fn test_malformed_events_are_ignored() {
        let service = InMemoryService::new();
        let b = elector(&service, "B");
        b.on_change(WatchEvent::created(KEY, "C", 3)).await.unwrap();

        let missing_value = WatchEvent {
            action: EventAction::Updated,
            key: KEY.to_string(),
            value: None,
            revision: 4,
        };
        let unknown = WatchEvent {
            action: EventAction::Unknown("compare_and_swap".to_string()),
            key: KEY.to_string(),
            value: Some("X".to_string()),
            revision: 5,
        };
        b.on_change(missing_value).await.unwrap();
        b.on_change(unknown).await.unwrap();

        assert_eq!(b.current_leader_id().unwrap().as_str(), "C");
    }

    #[tokio::test]
    async fn test_confirm_reclaims_vacant_key() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        let b = elector(&service, "B");
        a.attempt_election().await.unwrap();
        b.attempt_election().await.unwrap();

        let lease = a.leases.current().await.unwrap();
        service.expire_lease(lease.id);

        assert_eq!(b.confirm_leadership().await.unwrap(), Role::Leading);
    }

    #[tokio::test]
    async fn test_empty_incumbent_is_unknown_leader() {
        let service = InMemoryService::new();
        let squatter = service.connect("squatter");
        let lease = squatter.create_lease(Duration::from_secs(10)).await.unwrap();
        squatter.create_if_absent(KEY, "", lease).await.unwrap();

        let b = elector(&service, "B");
        let outcome = b.attempt_election().await.unwrap();

        assert_eq!(outcome.role, Role::Unknown);
        assert_eq!(outcome.leader, None);
        assert_eq!(b.current_leader_id(), None);
        assert!(!b.is_leader());
        assert_eq!(b.confirm_leadership().await.unwrap(), Role::Unknown);
    }

    #[tokio::test]
    async fn test_step_down_forgets_leadership_when_unreachable() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        a.attempt_election().await.unwrap();
        let lease = a.leases.current().await.unwrap();

        service.partition("A");
        assert!(a.step_down(lease.id).await.is_err());
        assert!(!a.is_leader());
        assert_eq!(a.role(), Role::Unknown);

        service.heal("A");
        assert_eq!(a.confirm_leadership().await.unwrap(), Role::Leading);
    }

    #[tokio::test]
    async fn test_resync_reads_current_holder() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        let b = elector(&service, "B");
        let claimed = a.attempt_election().await.unwrap();

        let revision = b.resync().await.unwrap();

        assert_eq!(revision, claimed.revision);
        assert_eq!(b.current_leader_id().unwrap().as_str(), "A");
        assert_eq!(b.claim_attempts(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_role_changes() {
        let service = InMemoryService::new();
        let a = elector(&service, "A");
        let mut changes = a.subscribe();

        a.attempt_election().await.unwrap();

        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().role_of(a.self_id()), Role::Leading);
    }
}
