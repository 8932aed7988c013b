//! Process shell around the `election` crate: identity, settings, wiring
//! and process lifetime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use election::{CoordinationService, Leadership, Participant, ParticipantId, Role};
use tracing::{info, warn};

mod cli;
pub use cli::{Backend, Cli};

pub mod settings;
pub use settings::Settings;

pub async fn connect(settings: &Settings) -> Result<Arc<dyn CoordinationService>> {
    match settings.backend {
        Backend::Memory => {
            warn!("memory backend: the election only spans this process");
            Ok(Arc::new(election::InMemoryService::new().connect("leaderd")))
        }
        Backend::Etcd => connect_etcd(&settings.endpoints).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(endpoints: &[String]) -> Result<Arc<dyn CoordinationService>> {
    info!(?endpoints, "connecting to etcd");
    Ok(Arc::new(election::etcd::EtcdService::connect(endpoints).await?))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_endpoints: &[String]) -> Result<Arc<dyn CoordinationService>> {
    anyhow::bail!("built without the `etcd` feature; rebuild with `--features etcd` or pass `--backend memory`")
}

pub fn participant(
    id: &str,
    settings: &Settings,
    service: Arc<dyn CoordinationService>,
) -> Result<Participant> {
    let id = ParticipantId::new(id)?;
    Ok(Participant::new(id, settings.election.clone(), service)?)
}

/// Elects, follows leadership changes until `duration` passes or `stop`
/// resolves, then leaves the election.
pub async fn run<F>(participant: &Participant, duration: Duration, stop: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let outcome = participate(participant, duration, stop).await;
    let left = participant.shutdown().await;
    outcome?;
    left?;
    Ok(())
}

async fn participate<F>(participant: &Participant, duration: Duration, stop: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    participant.start_election().await?;
    participant.watch_for_leader_change().await?;

    let mut changes = participant.leadership();
    announce(participant.self_id(), &changes.borrow_and_update());

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!(?duration, "run duration elapsed");
                break;
            }
            _ = &mut stop => {
                info!("stop requested");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                announce(participant.self_id(), &changes.borrow_and_update());
            }
        }
    }
    Ok(())
}

fn announce(id: &ParticipantId, leadership: &Leadership) {
    match (leadership.role_of(id), &leadership.leader) {
        (Role::Leading, _) => info!(%id, "I am the leader"),
        (Role::Following, Some(leader)) => info!(%id, %leader, "following"),
        _ => warn!(%id, "leader unknown"),
    }
}
