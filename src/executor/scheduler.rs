//! Executor: bounded worker pool driving jobs through locks and the engine
//!
//! Workers pull job ids off a FIFO queue. A worker is occupied only while
//! blocked on lock acquisition or actually running steps; `submit` never
//! blocks the caller. Execution order across jobs contending on the same
//! resource follows lock-grant order, not submission order.

use crate::common::config::ExecutorConfig;
use crate::common::utils::timestamp_now;
use crate::driver::DatabaseDriver;
use crate::events::{EventBus, FarmEventKind};
use crate::executor::engine::ProcedureEngine;
use crate::executor::job::{Checkpoint, Job, JobId, JobReport, JobStatus};
use crate::executor::lock::LockManager;
use crate::store::StorageAdapter;
use crate::topology::TopologyStore;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct JobSlot {
    report: JobReport,
    /// Present until a worker picks the job up (or it is cancelled)
    pending: Option<Job>,
    status_tx: watch::Sender<JobStatus>,
}

struct ExecutorInner {
    cfg: ExecutorConfig,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
    jobs: Mutex<HashMap<JobId, JobSlot>>,
    locks: LockManager,
    engine: ProcedureEngine,
    store: Arc<dyn StorageAdapter>,
    events: EventBus,
}

/// Job executor with a fixed-size worker pool
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(
        cfg: ExecutorConfig,
        store: Arc<dyn StorageAdapter>,
        driver: Arc<dyn DatabaseDriver>,
        topology: Arc<TopologyStore>,
        events: EventBus,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let engine = ProcedureEngine::new(
            store.clone(),
            driver,
            topology,
            cfg.driver_retries,
            Duration::from_millis(cfg.retry_delay_ms),
        );
        Self {
            inner: Arc::new(ExecutorInner {
                cfg,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                jobs: Mutex::new(HashMap::new()),
                locks: LockManager::new(),
                engine,
                store,
                events,
            }),
        }
    }

    /// The lock manager guarding the farm's resources
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Spawn the worker pool
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        (0..self.inner.cfg.workers)
            .map(|n| {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tracing::debug!("worker {} up", n);
                    loop {
                        let id = {
                            let mut rx = inner.queue_rx.lock().await;
                            rx.recv().await
                        };
                        match id {
                            Some(id) => inner.process(id).await,
                            None => break,
                        }
                    }
                })
            })
            .collect()
    }

    /// Enqueue a job. Never blocks; the id is usable for `status`/`wait`.
    pub fn submit(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        // The enqueue must be durable before the caller learns the id
        self.inner
            .store
            .save_checkpoint(&Checkpoint::of(&job, JobStatus::Enqueued, None, None))
            .map_err(|e| crate::Error::Checkpoint(e.to_string()))?;

        let (status_tx, _) = watch::channel(JobStatus::Enqueued);
        let slot = JobSlot {
            report: JobReport::enqueued(&job),
            pending: Some(job),
            status_tx,
        };
        self.inner.jobs.lock().unwrap().insert(id, slot);
        self.inner
            .queue_tx
            .send(id)
            .map_err(|_| crate::Error::Internal("executor queue closed".into()))?;
        tracing::info!("job {} enqueued", id);
        Ok(id)
    }

    /// Snapshot of a job's current state and result
    pub fn status(&self, id: JobId) -> Option<JobReport> {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .get(&id)
            .map(|slot| slot.report.clone())
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait(&self, id: JobId) -> Result<JobReport> {
        let mut rx = {
            let jobs = self.inner.jobs.lock().unwrap();
            let slot = jobs
                .get(&id)
                .ok_or_else(|| crate::Error::JobNotFound(id.to_string()))?;
            slot.status_tx.subscribe()
        };
        loop {
            if rx.borrow().is_terminal() {
                return self
                    .status(id)
                    .ok_or_else(|| crate::Error::JobNotFound(id.to_string()));
            }
            rx.changed()
                .await
                .map_err(|_| crate::Error::Internal("job status channel closed".into()))?;
        }
    }

    /// Best-effort cancel: stops a job that has not started; a running job is
    /// untouched (only compensation can undo committed steps)
    pub fn cancel(&self, id: JobId) -> bool {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let Some(slot) = jobs.get_mut(&id) else {
            return false;
        };
        let Some(job) = slot.pending.take() else {
            return false;
        };
        let err = crate::Error::Cancelled;
        slot.report.status = JobStatus::Failed;
        slot.report.error = Some(err.to_string());
        let _ = self.inner.store.save_checkpoint(&Checkpoint::of(
            &job,
            JobStatus::Failed,
            None,
            Some(err.to_string()),
        ));
        slot.status_tx.send_replace(JobStatus::Failed);
        tracing::info!("job {} cancelled before start", id);
        true
    }

    /// Re-admit jobs found pending in the store after a restart.
    ///
    /// Enqueued jobs and cleanly-checkpointed running jobs go back on the
    /// queue (the latter resume at their cursor after re-acquiring locks);
    /// jobs with a step in flight are routed to the engine's interrupted
    /// path, which compensates that step and fails them.
    pub fn recover(&self) -> Result<usize> {
        let pending = self.inner.store.load_pending_jobs()?;
        let mut count = 0;
        for cp in pending {
            let job = cp.into_job();
            let id = job.id;
            tracing::info!(
                "recovering job {} ({}) at step {}{}",
                id,
                job.label,
                job.cursor,
                if job.interrupted.is_some() {
                    ", interrupted mid-step"
                } else {
                    ""
                }
            );
            let (status_tx, _) = watch::channel(JobStatus::Enqueued);
            let slot = JobSlot {
                report: JobReport::enqueued(&job),
                pending: Some(job),
                status_tx,
            };
            self.inner.jobs.lock().unwrap().insert(id, slot);
            self.inner
                .queue_tx
                .send(id)
                .map_err(|_| crate::Error::Internal("executor queue closed".into()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Drop terminal checkpoints older than the retention horizon
    pub fn prune_finished(&self) -> Result<usize> {
        let horizon = timestamp_now().saturating_sub(self.inner.cfg.retention_secs);
        let mut pruned = 0;
        for cp in self.inner.store.list_checkpoints()? {
            if cp.status.is_terminal() && cp.updated_at < horizon {
                self.inner.store.delete_checkpoint(cp.job_id)?;
                self.inner.jobs.lock().unwrap().remove(&cp.job_id);
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!("pruned {} finished jobs", pruned);
        }
        Ok(pruned)
    }
}

impl ExecutorInner {
    async fn process(&self, id: JobId) {
        let Some(mut job) = ({
            let mut jobs = self.jobs.lock().unwrap();
            jobs.get_mut(&id).and_then(|slot| slot.pending.take())
        }) else {
            // Cancelled or already picked up
            return;
        };

        if let Err(e) = self
            .locks
            .acquire(&job.lock_keys, id, self.cfg.lock_wait())
            .await
        {
            // Contention exceeded the configured bound; the job fails with
            // nothing executed and nothing held
            self.finish(
                &job,
                JobReport {
                    id,
                    label: job.label.clone(),
                    status: JobStatus::Failed,
                    result: None,
                    error: Some(e.to_string()),
                    compensation_errors: Vec::new(),
                },
            );
            let _ = self.store.save_checkpoint(&Checkpoint::of(
                &job,
                JobStatus::Failed,
                None,
                Some(e.to_string()),
            ));
            return;
        }

        self.set_status(id, JobStatus::Running);
        if let Err(e) = self
            .engine
            .checkpoint(&job, JobStatus::Running, None, None)
        {
            self.locks.release_all(id);
            self.finish(
                &job,
                JobReport {
                    id,
                    label: job.label.clone(),
                    status: JobStatus::Failed,
                    result: None,
                    error: Some(e.to_string()),
                    compensation_errors: Vec::new(),
                },
            );
            return;
        }

        let report = self.engine.run(&mut job).await;
        self.locks.release_all(id);
        self.finish(&job, report);
    }

    fn set_status(&self, id: JobId, status: JobStatus) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(slot) = jobs.get_mut(&id) {
            slot.report.status = status;
            slot.status_tx.send_replace(status);
        }
    }

    fn finish(&self, job: &Job, report: JobReport) {
        match report.status {
            JobStatus::Complete => self.events.publish(FarmEventKind::JobCompleted {
                job: job.id,
                label: job.label.clone(),
            }),
            JobStatus::Failed => self.events.publish(FarmEventKind::JobFailed {
                job: job.id,
                label: job.label.clone(),
                error: report.error.clone().unwrap_or_default(),
            }),
            _ => {}
        }
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(slot) = jobs.get_mut(&job.id) {
            let status = report.status;
            slot.report = report;
            slot.status_tx.send_replace(status);
        }
    }
}
