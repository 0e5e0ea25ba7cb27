//! Image job pipeline.
//!
//! - **Jobs**: `ImageJob` records, one per acquired sub-exposure
//! - **State machine**: legal transitions and the update check the store runs
//! - **Stacked images**: per target and filter aggregates that jobs fold into
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐    ┌────────────┐    ┌────────────┐    ┌─────────┐
//! │ Pending │───▶│ Downloaded │───▶│ Processing │───▶│ Stacked │
//! └─────────┘    └────────────┘    └────────────┘    └─────────┘
//!      │               │                 │
//!      └───────────────┴─────────────────┴──────────▶ Failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut job = store.get_job(id).await?;
//! job.mark_downloaded("/tmp/42.fits")?;
//! let job = store.update_job(&job).await?;
//! ```

pub mod job;
pub mod stacked;
pub mod state_machine;

pub use job::{now, store_time, ImageJob, JobId, JobStatus, StackedImageId};
pub use stacked::{check_stacked_update, NewStackedImage, StackedImage};
pub use state_machine::check_update;
