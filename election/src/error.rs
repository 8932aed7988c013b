use crate::service::LeaseId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Lease {lease} not found")]
    LeaseNotFound { lease: LeaseId },

    #[error("Lease {lease} lost after {failures} failed renewals")]
    LeaseExpired { lease: LeaseId, failures: u32 },

    #[error("Election failed after {attempts} attempts: {source}")]
    ElectionFailed {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid participant id: {0:?}")]
    InvalidParticipant(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Participant has been shut down")]
    ShutDown,

    /// The requested watch start revision is older than the history the service kept.
    #[error("Watch history compacted, oldest available revision is {compact_revision}")]
    Compacted { compact_revision: i64 },

    #[error("etcd error: {0}")]
    Etcd(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a fresh attempt against the service may succeed.
    ///
    /// Lease problems count as transient: the next attempt runs with a newly
    /// granted lease.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unavailable(_)
            | Error::LeaseNotFound { .. }
            | Error::LeaseExpired { .. }
            | Error::Etcd(_) => true,
            _ => false,
        }
    }

    /// Whether the local lease handle should be dropped before retrying.
    pub fn invalidates_lease(&self) -> bool {
        matches!(self, Error::LeaseNotFound { .. } | Error::LeaseExpired { .. })
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        match e {
            etcd_client::Error::GRpcStatus(_) | etcd_client::Error::TransportError(_) => {
                Error::Unavailable(e.to_string())
            }
            other => Error::Etcd(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
