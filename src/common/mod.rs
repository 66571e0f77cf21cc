//! Common utilities and types shared across farmd

pub mod config;
pub mod error;
pub mod utils;

pub use config::{DetectorConfig, ExecutorConfig, FailoverConfig, FarmConfig};
pub use error::{Error, Result};
pub use utils::{retry_with_backoff, timestamp_now, timestamp_now_millis};
