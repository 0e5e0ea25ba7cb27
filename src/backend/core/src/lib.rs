#![allow(clippy::result_large_err)]
//! # Stacker Core
//!
//! Worker skeleton for a distributed astronomical image-processing pipeline.
//!
//! ## Architecture
//!
//! - **Jobs**: image job state machine and stacked image aggregates
//! - **Store**: SQLite, PostgreSQL or MySQL persistence with scoped handles
//! - **Listeners**: main, metrics and diagnostics HTTP listeners sharing one lifecycle
//! - **API**: REST handlers, Prometheus exposition and runtime diagnostics
//! - **Telemetry**: structured logging and metrics

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod listeners;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, StackerError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, StorageKind};
    pub use crate::db::{SchedulerStore, Scope, Store, StoreOptions, Target};
    pub use crate::error::{ErrorCode, Result, StackerError};
    pub use crate::jobs::{ImageJob, JobId, JobStatus, NewStackedImage, StackedImage, StackedImageId};
    pub use crate::listeners::{GroupState, ListenerDescriptor, ListenerGroup, ListenerState};
}
