//! # farmd
//!
//! Management core for farms of replicated database server groups:
//! - a job executor running multi-step administrative procedures with
//!   mutual-exclusion locking, crash-safe checkpointing, and compensating
//!   rollback
//! - a heartbeat failure detector with threshold-based FAULTY declaration
//! - a failover controller that promotes a replacement primary through the
//!   same executor path manual operations use
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   submit(job)   ┌──────────────────────────────┐
//! │ Command layer  ├────────────────►│          Executor            │
//! │ (external)     │   status(id)    │  worker pool + lock manager  │
//! └────────────────┘                 │  + procedure engine          │
//!                                    └───────┬──────────────┬───────┘
//! ┌────────────────┐  on_server_faulty      │ checkpoints  │ driver calls
//! │ FailureDetector├───────────────┐        ▼              ▼
//! │ (heartbeats)   │        ┌──────┴───────┐  ┌──────────────────────┐
//! └───────┬────────┘        │  Failover    │  │ StorageAdapter /     │
//!         │ ping            │  Controller  │  │ DatabaseDriver       │
//!         ▼                 └──────────────┘  │ (capabilities)       │
//!   database servers                          └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! farmd serve --config farmd.toml
//! ```
//!
//! Topology mutations happen exclusively inside executed job steps; the
//! detector only reports, and the controller only submits jobs.

pub mod common;
pub mod detector;
pub mod driver;
pub mod events;
pub mod executor;
pub mod failover;
pub mod farm;
pub mod store;
pub mod topology;

// Re-export commonly used types
pub use common::{Error, FarmConfig, Result};
pub use detector::FailureDetector;
pub use driver::DatabaseDriver;
pub use events::{EventBus, FarmEvent, FarmEventKind};
pub use executor::{Executor, Job, JobId, JobReport, JobStatus, LockManager, ResourceKey, Step};
pub use failover::FailoverController;
pub use farm::Farm;
pub use store::{MemoryStore, StorageAdapter};
pub use topology::{Group, Server, ServerId, ServerMode, ServerStatus, TopologyStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
