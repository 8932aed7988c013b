use crate::{
    config::ElectionConfig,
    elector::{ElectionOutcome, Elector, Leadership, Role},
    error::{Error, Result},
    lease::{Lease, LeaseManager},
    service::{CoordinationService, LeaseId},
    watcher::ChangeWatcher,
    ParticipantId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One process taking part in the election.
///
/// Wires the lease manager, the elector and the change watcher together
/// and owns their teardown order: watcher first, then the lease, so the
/// key deletion caused by revoking our own lease is never reacted to.
/// A lease lost in the background makes the elector step down at once,
/// without waiting for a change notification that may never arrive.
#[derive(Debug)]
pub struct Participant {
    config: ElectionConfig,
    service: Arc<dyn CoordinationService>,
    leases: Arc<LeaseManager>,
    elector: Arc<Elector>,
    watcher: Mutex<Option<ChangeWatcher>>,
    loss_monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Participant {
    pub fn new(
        id: ParticipantId,
        config: ElectionConfig,
        service: Arc<dyn CoordinationService>,
    ) -> Result<Self> {
        config.validate()?;
        let leases = Arc::new(LeaseManager::new(
            service.clone(),
            config.renewal_failure_limit,
        ));
        let elector = Arc::new(Elector::new(id, &config, service.clone(), leases.clone()));
        Ok(Self {
            config,
            service,
            leases,
            elector,
            watcher: Mutex::new(None),
            loss_monitor: parking_lot::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub async fn start_election(&self) -> Result<ElectionOutcome> {
        self.ensure_running()?;
        self.arm_loss_monitor();
        self.elector.attempt_election().await
    }

    /// Arms the change watcher just past the revision the current state reflects.
    pub async fn watch_for_leader_change(&self) -> Result<()> {
        self.ensure_running()?;
        self.arm_loss_monitor();
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            return Ok(());
        }

        let revision = self.elector.leadership().revision;
        let start = (revision > 0).then_some(revision + 1);
        *watcher = Some(
            ChangeWatcher::watch(
                self.service.clone(),
                self.elector.key(),
                start,
                self.elector.clone(),
                self.config.retry.clone(),
            )
            .await?,
        );
        Ok(())
    }

    /// Re-reads the key from the service before acting on leadership.
    pub async fn confirm_leadership(&self) -> Result<bool> {
        self.ensure_running()?;
        self.arm_loss_monitor();
        Ok(self.elector.confirm_leadership().await? == Role::Leading)
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn current_leader_id(&self) -> Option<ParticipantId> {
        self.elector.current_leader_id()
    }

    pub fn self_id(&self) -> &ParticipantId {
        self.elector.self_id()
    }

    pub fn role(&self) -> Role {
        self.elector.role()
    }

    pub fn leadership(&self) -> watch::Receiver<Leadership> {
        self.elector.subscribe()
    }

    pub fn claim_attempts(&self) -> u64 {
        self.elector.claim_attempts()
    }

    pub async fn lease(&self) -> Option<Lease> {
        self.leases.current().await
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Cancels the watcher, then revokes the lease, then forgets the leader.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let monitor = self.loss_monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.cancel().await;
        }
        let revoked = self.leases.cancel().await;
        self.elector.vacate();

        match revoked {
            Ok(()) => {
                info!(id = %self.self_id(), "left the election");
                Ok(())
            }
            Err(e) => {
                warn!(id = %self.self_id(), "lease revocation failed, it will expire: {}", e);
                Err(e)
            }
        }
    }

    /// Every path that can claim goes through here first, so a lease is
    /// never held without someone listening for its loss.
    fn arm_loss_monitor(&self) {
        let mut monitor = self.loss_monitor.lock();
        if monitor.is_none() {
            *monitor = Some(tokio::spawn(follow_lease_losses(
                self.elector.clone(),
                self.leases.losses(),
            )));
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

async fn follow_lease_losses(elector: Arc<Elector>, mut losses: watch::Receiver<Option<LeaseId>>) {
    while losses.changed().await.is_ok() {
        let lost = *losses.borrow_and_update();
        let Some(lease) = lost else {
            continue;
        };
        match elector.step_down(lease).await {
            Ok(role) => info!(id = %elector.self_id(), ?role, "re-read leadership after lease loss"),
            Err(e) => debug!(id = %elector.self_id(), "leadership unknown until the service is reachable: {}", e),
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        // Same order as shutdown; the lease is left to expire on the service.
        if let Some(monitor) = self.loss_monitor.get_mut().take() {
            monitor.abort();
        }
        drop(self.watcher.get_mut().take());
        self.leases.abandon();
    }
}
