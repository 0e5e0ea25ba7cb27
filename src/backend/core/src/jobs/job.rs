//! Image job entities.
//!
//! This module provides the persisted shapes the pipeline works on:
//!
//! - **JobId / StackedImageId**: store-assigned identifiers
//! - **JobStatus**: the five pipeline states and their edges
//! - **ImageJob**: one acquired sub-exposure moving through the pipeline

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StackerError};

// ═══════════════════════════════════════════════════════════════════════════════
// Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for an image job, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a stacked image, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackedImageId(pub i64);

impl fmt::Display for StackedImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for StackedImageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of an image job.
///
/// The forward path is `Pending → Downloaded → Processing → Stacked`.
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job was created and the sub-exposure has not been fetched yet
    Pending,
    /// The sub-exposure is available at the job's file path
    Downloaded,
    /// Calibration and alignment are running
    Processing,
    /// The sub-exposure was folded into a stacked image
    Stacked,
    /// Processing gave up; the job carries the reason
    Failed,
}

impl JobStatus {
    /// Every status, in pipeline order.
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Downloaded,
        Self::Processing,
        Self::Stacked,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Processing => "processing",
            Self::Stacked => "stacked",
            Self::Failed => "failed",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stacked | Self::Failed)
    }

    /// The single forward successor, if any.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            Self::Pending => Some(Self::Downloaded),
            Self::Downloaded => Some(Self::Processing),
            Self::Processing => Some(Self::Stacked),
            Self::Stacked | Self::Failed => None,
        }
    }

    /// Check whether the edge `self → target` exists.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        match target {
            Self::Failed => !self.is_terminal(),
            _ => self.next() == Some(target),
        }
    }

    /// Statuses reachable from this one in a single step.
    pub fn allowed_targets(&self) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|target| self.can_transition_to(*target))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StackerError::validation(format!("unknown job status: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Image Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One acquired sub-exposure awaiting processing.
///
/// Values are owned snapshots of a stored row. Mutate a snapshot through the
/// transition methods and hand it back to the store to persist it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    pub id: JobId,
    /// Reference to the source acquisition; unique across jobs
    pub acquired_image_id: i64,
    pub status: JobStatus,
    /// Opaque location of the downloaded sub-exposure
    pub file_path: Option<String>,
    /// Failure reason, present only when failed
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Stacked image this job was folded into, present only when stacked
    pub stacked_image_id: Option<StackedImageId>,
    /// Row version, bumped by the store on every successful update
    pub revision: i64,
}

impl ImageJob {
    /// The most recent timestamp recorded on the job.
    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        [self.downloaded_at, self.processed_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, std::cmp::max)
    }
}

/// Timestamps are kept at microsecond precision, the finest every backend stores.
pub fn store_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Current time at store precision.
pub fn now() -> DateTime<Utc> {
    store_time(Utc::now())
}
