//! Notification feed of farm state transitions
//!
//! Every transition worth telling an operator about is published here and
//! mirrored into the tracing log: suspect warnings, faulty alerts, failover
//! lifecycle, cool-down suppressions. Subscribers that fall behind lose old
//! events, not new ones.

use crate::executor::job::JobId;
use crate::topology::{GroupId, ServerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct FarmEvent {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FarmEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FarmEventKind {
    ServerSuspect {
        server: ServerId,
        failures: u32,
    },
    ServerFaulty {
        server: ServerId,
    },
    FailoverStarted {
        group: GroupId,
        job: JobId,
        candidate: ServerId,
    },
    FailoverSuppressed {
        group: GroupId,
        remaining_ms: u64,
    },
    GroupLeaderless {
        group: GroupId,
    },
    JobCompleted {
        job: JobId,
        label: String,
    },
    JobFailed {
        job: JobId,
        label: String,
        error: String,
    },
}

/// Broadcast bus for farm events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FarmEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, mirroring it into the log at a fitting level
    pub fn publish(&self, kind: FarmEventKind) {
        match &kind {
            FarmEventKind::ServerSuspect { server, failures } => {
                tracing::warn!("server {} suspect after {} failed checks", server, failures);
            }
            FarmEventKind::ServerFaulty { server } => {
                tracing::error!("server {} declared FAULTY", server);
            }
            FarmEventKind::FailoverStarted { group, job, candidate } => {
                tracing::info!(
                    "failover of group {} started: promoting {} (job {})",
                    group,
                    candidate,
                    job
                );
            }
            FarmEventKind::FailoverSuppressed { group, remaining_ms } => {
                tracing::warn!(
                    "failover of group {} suppressed by cool-down ({}ms remaining)",
                    group,
                    remaining_ms
                );
            }
            FarmEventKind::GroupLeaderless { group } => {
                tracing::error!("group {} is leaderless: no eligible candidate", group);
            }
            FarmEventKind::JobCompleted { job, label } => {
                tracing::info!("job {} ({}) complete", job, label);
            }
            FarmEventKind::JobFailed { job, label, error } => {
                tracing::warn!("job {} ({}) failed: {}", job, label, error);
            }
        }
        // No subscribers is fine
        let _ = self.tx.send(FarmEvent {
            timestamp: Utc::now(),
            kind,
        });
    }
}
