//! Job executor: locking, procedures, checkpointed execution

pub mod engine;
pub mod job;
pub mod lock;
pub mod procedure;
pub mod scheduler;

pub use job::{Job, JobId, JobReport, JobStatus};
pub use lock::{LockManager, ResourceKey};
pub use procedure::Step;
pub use scheduler::Executor;
