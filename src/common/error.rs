//! Error types for farmd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Driver Errors ===
    #[error("Transport error on {server}: {reason}")]
    Transport { server: String, reason: String },

    #[error("Operation rejected by {server}: {reason}")]
    Semantic { server: String, reason: String },

    #[error("Server {0} is already primary")]
    AlreadyPrimary(String),

    // === Executor Errors ===
    #[error("Lock wait timed out on {0}")]
    LockTimeout(String),

    #[error("Checkpoint write failed: {0}")]
    Checkpoint(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job cancelled before start")]
    Cancelled,

    #[error("Job interrupted mid-step {step}: {reason}")]
    Interrupted { step: usize, reason: String },

    // === Failover Errors ===
    #[error("No eligible failover candidate in group {0}")]
    NoCandidate(String),

    // === Topology Errors ===
    #[error("Group {0} does not exist")]
    GroupNotFound(String),

    #[error("Server {0} is not registered")]
    ServerNotFound(String),

    #[error("Group error: {0}")]
    Group(String),

    #[error("Server error: {0}")]
    Server(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only transport-level failures qualify. A semantic rejection means the
    /// server was reached and said no; retrying cannot change the answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout(_) | Error::Io(_))
    }

    /// Does this error abort a job without running compensations?
    ///
    /// A failed checkpoint write leaves the job's durable state unknown, so no
    /// further recovery is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Checkpoint(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let transport = Error::Transport {
            server: "s1".into(),
            reason: "connection refused".into(),
        };
        assert!(transport.is_retryable());
        assert!(Error::Timeout("connect to db1:3306".into()).is_retryable());

        let semantic = Error::Semantic {
            server: "s1".into(),
            reason: "read_only cannot be set".into(),
        };
        assert!(!semantic.is_retryable());

        assert!(!Error::AlreadyPrimary("s1".into()).is_retryable());
    }

    #[test]
    fn test_fatal() {
        assert!(Error::Checkpoint("disk full".into()).is_fatal());
        assert!(!Error::LockTimeout("group:g1".into()).is_fatal());
    }
}
