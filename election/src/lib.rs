#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Leader election over a strongly-consistent coordination service.
//!
//! Each participant holds a lease and races to create the election key
//! bound to it. The key's value names the leader; its deletion (lease
//! revoked or expired) sends every survivor back into the race.

pub mod config;
pub mod elector;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod lease;
pub mod memory;
pub mod participant;
pub mod service;
pub mod watcher;

pub mod test_utils;

pub use config::{ElectionConfig, RetryPolicy};
pub use elector::{ElectionOutcome, Elector, Leadership, Role};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseManager};
pub use memory::InMemoryService;
pub use participant::Participant;
pub use service::{CoordinationService, EventAction, LeaseId, WatchEvent};

use std::fmt;

/// Caller-supplied identity of a participant. Uniqueness is the caller's problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() || id.chars().any(char::is_control) {
            return Err(Error::InvalidParticipant(id));
        }
        Ok(Self(id))
    }

    /// Wraps a value read back from the service without validation.
    pub(crate) fn from_service(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_validation() {
        assert_eq!(ParticipantId::new("node-1").unwrap().as_str(), "node-1");
        assert!(ParticipantId::new("").is_err());
        assert!(ParticipantId::new("   ").is_err());
        assert!(matches!(
            ParticipantId::new("a\nb"),
            Err(Error::InvalidParticipant(_))
        ));
    }
}
