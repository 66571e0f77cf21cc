//! Jobs and their durable checkpoints

use crate::common::utils::timestamp_now;
use crate::executor::lock::ResourceKey;
use crate::executor::procedure::Step;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Enqueued,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Enqueued => write!(f, "enqueued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One administrative operation: an ordered step chain plus the resources it
/// must hold while running
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub label: String,
    pub steps: Vec<Step>,
    pub lock_keys: BTreeSet<ResourceKey>,
    /// Index of the first step not yet completed
    pub cursor: usize,
    /// Output of the last completed step, input to the next
    pub state: serde_json::Value,
    /// Set by crash recovery when this step was mid-execution at the crash
    pub interrupted: Option<usize>,
    pub created_at: u64,
}

impl Job {
    pub fn new(label: impl Into<String>, steps: Vec<Step>, lock_keys: BTreeSet<ResourceKey>) -> Self {
        Self {
            id: JobId::new(),
            label: label.into(),
            steps,
            lock_keys,
            cursor: 0,
            state: serde_json::Value::Null,
            interrupted: None,
            created_at: timestamp_now(),
        }
    }
}

/// Externally visible job outcome, in the `(uuid, status, result)` shape
/// surfaced to the command layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub label: String,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Compensation failures recorded while rolling back, best-effort
    pub compensation_errors: Vec<String>,
}

impl JobReport {
    pub fn enqueued(job: &Job) -> Self {
        Self {
            id: job.id,
            label: job.label.clone(),
            status: JobStatus::Enqueued,
            result: None,
            error: None,
            compensation_errors: Vec::new(),
        }
    }
}

/// Durable record of a job's progress
///
/// `cursor` counts completed steps; `in_flight` marks a step whose side
/// effects are unknown if the process dies before the next cursor advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub label: String,
    pub steps: Vec<Step>,
    pub lock_keys: BTreeSet<ResourceKey>,
    pub status: JobStatus,
    pub cursor: usize,
    pub in_flight: Option<usize>,
    pub state: serde_json::Value,
    pub error: Option<String>,
    pub updated_at: u64,
}

impl Checkpoint {
    pub fn of(job: &Job, status: JobStatus, in_flight: Option<usize>, error: Option<String>) -> Self {
        Self {
            job_id: job.id,
            label: job.label.clone(),
            steps: job.steps.clone(),
            lock_keys: job.lock_keys.clone(),
            status,
            cursor: job.cursor,
            // A job still carrying an interrupted marker keeps it durable
            // through intermediate writes; it is cleared only once the
            // engine has dealt with the interrupted step
            in_flight: in_flight.or(job.interrupted),
            state: job.state.clone(),
            error,
            updated_at: timestamp_now(),
        }
    }

    /// Rebuild the runnable job this checkpoint describes
    pub fn into_job(self) -> Job {
        Job {
            id: self.job_id,
            label: self.label,
            steps: self.steps,
            lock_keys: self.lock_keys,
            cursor: self.cursor,
            state: self.state,
            interrupted: self.in_flight,
            created_at: self.updated_at,
        }
    }
}
