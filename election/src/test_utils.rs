use crate::{
    config::ElectionConfig, memory::InMemoryService, participant::Participant, ElectionOutcome,
    ParticipantId, Result,
};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TEST_KEY: &str = "MyApp/leader";

pub fn test_config(lease_ttl_ms: u64) -> ElectionConfig {
    ElectionConfig {
        lease_ttl_ms,
        ..ElectionConfig::with_key(TEST_KEY)
    }
}

/// Participants sharing one in-memory service, each on its own named client.
#[derive(Debug)]
pub struct TestCluster {
    pub service: InMemoryService,
    pub participants: Vec<Participant>,
}

impl TestCluster {
    pub fn new(names: &[&str], config: ElectionConfig) -> Self {
        let service = InMemoryService::new();
        let participants = names
            .iter()
            .map(|name| {
                Participant::new(
                    ParticipantId::new(*name).expect("valid test id"),
                    config.clone(),
                    Arc::new(service.connect(name)),
                )
                .expect("valid test config")
            })
            .collect();
        Self {
            service,
            participants,
        }
    }

    /// Runs every participant's first election concurrently.
    pub async fn race(&self) -> Vec<Result<ElectionOutcome>> {
        join_all(self.participants.iter().map(|p| p.start_election())).await
    }

    pub async fn watch_all(&self) -> Result<()> {
        for participant in &self.participants {
            participant.watch_for_leader_change().await?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> &Participant {
        self.participants
            .iter()
            .find(|p| p.self_id().as_str() == name)
            .expect("participant in cluster")
    }

    /// Removes a participant without revoking its lease and expires the
    /// lease on the service, as if the process had crashed.
    pub async fn crash(&mut self, name: &str) {
        let index = self
            .participants
            .iter()
            .position(|p| p.self_id().as_str() == name)
            .expect("participant in cluster");
        let victim = self.participants.remove(index);
        let lease = victim.lease().await;
        drop(victim);
        if let Some(lease) = lease {
            self.service.expire_lease(lease.id);
        }
    }

    pub fn leaders(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.is_leader())
            .map(|p| p.self_id().to_string())
            .collect()
    }

    pub async fn shutdown(&self) {
        for participant in &self.participants {
            let _ = participant.shutdown().await;
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
