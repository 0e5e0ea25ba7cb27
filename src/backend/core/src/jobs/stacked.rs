//! Stacked images: the combined output of jobs sharing a target and filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::StackedImageId;
use crate::error::{Result, StackerError};

/// Combined output of one or more image jobs sharing a grouping key.
///
/// A key has exactly one stacked image. Folding in more sub-exposures
/// supersedes it in place; it is never deleted implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackedImage {
    pub id: StackedImageId,
    pub target_id: i64,
    pub filter_name: String,
    /// Number of sub-exposures folded in, at least one
    pub image_count: i64,
    pub file_path: String,
    pub thumbnail_path: String,
    /// Size of the stacked file in bytes
    pub file_size: i64,
    pub processed_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Values for a stacked image the store has not assigned an id to yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStackedImage {
    pub target_id: i64,
    pub filter_name: String,
    pub image_count: i64,
    pub file_path: String,
    pub thumbnail_path: String,
    pub file_size: i64,
    pub processed_at: DateTime<Utc>,
}

impl StackedImage {
    /// Check the aggregate invariants.
    pub fn validate(&self) -> Result<()> {
        check_aggregate(
            &self.filter_name,
            self.image_count,
            self.file_size,
            self.processed_at,
            self.last_updated_at,
        )
    }

    /// Whether `other` describes the same grouping key.
    pub fn same_key(&self, other: &StackedImage) -> bool {
        self.target_id == other.target_id && self.filter_name == other.filter_name
    }
}

impl NewStackedImage {
    /// Check the aggregate invariants as of `last_updated_at`.
    pub fn validate(&self, last_updated_at: DateTime<Utc>) -> Result<()> {
        check_aggregate(
            &self.filter_name,
            self.image_count,
            self.file_size,
            self.processed_at,
            last_updated_at,
        )
    }
}

fn check_aggregate(
    filter_name: &str,
    image_count: i64,
    file_size: i64,
    processed_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
) -> Result<()> {
    if filter_name.trim().is_empty() {
        return Err(StackerError::precondition("filter name must not be empty"));
    }
    if image_count < 1 {
        return Err(StackerError::precondition(format!(
            "image count must be at least 1, got {}",
            image_count
        )));
    }
    if file_size < 0 {
        return Err(StackerError::precondition(format!(
            "file size must not be negative, got {}",
            file_size
        )));
    }
    if processed_at > last_updated_at {
        return Err(StackerError::precondition(
            "processed_at must not be later than last_updated_at",
        ));
    }
    Ok(())
}

/// Check a proposed supersession of a stacked image against the stored one.
pub fn check_stacked_update(persisted: &StackedImage, proposed: &StackedImage) -> Result<()> {
    if proposed.id != persisted.id || !proposed.same_key(persisted) {
        return Err(StackerError::precondition(format!(
            "grouping key of stacked image {} cannot change",
            persisted.id
        )));
    }
    if proposed.image_count < persisted.image_count {
        return Err(StackerError::image_count_decreased(
            persisted.image_count,
            proposed.image_count,
        ));
    }
    proposed.validate()
}
