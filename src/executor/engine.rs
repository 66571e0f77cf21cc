//! Procedure engine: sequential step execution with checkpoints and rollback
//!
//! Discipline, in order of precedence:
//! - no step starts before the previous checkpoint write is acknowledged
//! - a failed checkpoint write fails the job with no compensation, because
//!   durable state can no longer be trusted
//! - a failed step triggers the compensations of every completed step in
//!   strict reverse order, each attempted exactly once, best-effort
//! - a step found in flight after a crash is compensated and the job failed,
//!   never silently retried

use crate::common::utils::retry_with_backoff;
use crate::driver::DatabaseDriver;
use crate::executor::job::{Checkpoint, Job, JobReport, JobStatus};
use crate::executor::procedure::{Step, StepContext};
use crate::store::StorageAdapter;
use crate::topology::TopologyStore;
use std::sync::Arc;
use std::time::Duration;

pub struct ProcedureEngine {
    store: Arc<dyn StorageAdapter>,
    driver: Arc<dyn DatabaseDriver>,
    topology: Arc<TopologyStore>,
    retries: usize,
    retry_delay: Duration,
}

impl ProcedureEngine {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        driver: Arc<dyn DatabaseDriver>,
        topology: Arc<TopologyStore>,
        retries: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            driver,
            topology,
            retries,
            retry_delay,
        }
    }

    /// Run a job to a terminal state, starting at its cursor
    pub async fn run(&self, job: &mut Job) -> JobReport {
        if let Some(step_idx) = job.interrupted.take() {
            return self.recover_interrupted(job, step_idx).await;
        }

        for i in job.cursor..job.steps.len() {
            // Mark the step in flight before touching anything
            if let Err(e) = self.checkpoint(job, JobStatus::Running, Some(i), None) {
                return self.fail_without_compensation(job, e);
            }

            let step = job.steps[i].clone();
            tracing::info!("job {} step {}/{}: {}", job.id, i + 1, job.steps.len(), step.name());

            match self.execute_step(&step).await {
                Ok(output) => {
                    job.state = output;
                    job.cursor = i + 1;
                    if let Err(e) = self.checkpoint(job, JobStatus::Running, None, None) {
                        return self.fail_without_compensation(job, e);
                    }
                }
                // A durable-state failure surfacing through a step (the
                // topology writes inside it) is as untrustworthy as a failed
                // checkpoint: abort without compensating
                Err(err) if err.is_fatal() => return self.fail_without_compensation(job, err),
                Err(err) => {
                    tracing::warn!("job {} step {} failed: {}", job.id, step.name(), err);
                    let compensation_errors = self.compensate(&job.steps[..i]).await;
                    let report = JobReport {
                        id: job.id,
                        label: job.label.clone(),
                        status: JobStatus::Failed,
                        result: None,
                        error: Some(err.to_string()),
                        compensation_errors,
                    };
                    let _ = self.checkpoint(job, JobStatus::Failed, None, Some(err.to_string()));
                    return report;
                }
            }
        }

        let report = JobReport {
            id: job.id,
            label: job.label.clone(),
            status: JobStatus::Complete,
            result: Some(job.state.clone()),
            error: None,
            compensation_errors: Vec::new(),
        };
        if let Err(e) = self.checkpoint(job, JobStatus::Complete, None, None) {
            return self.fail_without_compensation(job, e);
        }
        report
    }

    /// Finish off a job whose step was mid-execution when the process died.
    ///
    /// The step's side effects are unknown, so its compensation (if defined)
    /// is attempted once and the job is failed rather than re-run.
    async fn recover_interrupted(&self, job: &mut Job, step_idx: usize) -> JobReport {
        let mut compensation_errors = Vec::new();
        if let Some(step) = job.steps.get(step_idx) {
            if let Some(comp) = step.compensation() {
                tracing::warn!(
                    "job {}: compensating step {} interrupted by crash",
                    job.id,
                    step.name()
                );
                if let Err(e) = self.execute_once(&comp).await {
                    compensation_errors.push(format!("{}: {}", comp.name(), e));
                }
            }
        }
        let err = crate::Error::Interrupted {
            step: step_idx,
            reason: "process crashed while the step was in flight".into(),
        };
        let report = JobReport {
            id: job.id,
            label: job.label.clone(),
            status: JobStatus::Failed,
            result: None,
            error: Some(err.to_string()),
            compensation_errors,
        };
        let _ = self.checkpoint(job, JobStatus::Failed, None, Some(err.to_string()));
        report
    }

    /// Run completed steps' compensations in reverse order, best-effort.
    ///
    /// Returns the errors collected along the way; a failed compensation does
    /// not stop the rest of the chain.
    async fn compensate(&self, completed: &[Step]) -> Vec<String> {
        let mut errors = Vec::new();
        for step in completed.iter().rev() {
            let Some(comp) = step.compensation() else {
                continue;
            };
            tracing::info!("compensating {} with {}", step.name(), comp.name());
            if let Err(e) = self.execute_once(&comp).await {
                tracing::warn!("compensation {} failed: {}", comp.name(), e);
                errors.push(format!("{}: {}", comp.name(), e));
            }
        }
        errors
    }

    async fn execute_step(&self, step: &Step) -> crate::Result<serde_json::Value> {
        let cx = StepContext {
            driver: self.driver.as_ref(),
            topology: self.topology.as_ref(),
        };
        retry_with_backoff(|| step.execute(&cx), self.retries, self.retry_delay).await
    }

    /// Single attempt, no retries: compensations run exactly once
    async fn execute_once(&self, step: &Step) -> crate::Result<serde_json::Value> {
        let cx = StepContext {
            driver: self.driver.as_ref(),
            topology: self.topology.as_ref(),
        };
        step.execute(&cx).await
    }

    fn fail_without_compensation(&self, job: &Job, err: crate::Error) -> JobReport {
        tracing::error!("job {} aborted, checkpoint unavailable: {}", job.id, err);
        JobReport {
            id: job.id,
            label: job.label.clone(),
            status: JobStatus::Failed,
            result: None,
            error: Some(err.to_string()),
            compensation_errors: Vec::new(),
        }
    }

    pub(crate) fn checkpoint(
        &self,
        job: &Job,
        status: JobStatus,
        in_flight: Option<usize>,
        error: Option<String>,
    ) -> crate::Result<()> {
        self.store
            .save_checkpoint(&Checkpoint::of(job, status, in_flight, error))
    }
}
