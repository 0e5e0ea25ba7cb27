//! Transition rules for image jobs.
//!
//! A transition validates everything first and mutates last, so a rejected
//! request leaves the job exactly as it was.

use chrono::{DateTime, Utc};

use super::job::{now, store_time, ImageJob, JobStatus, StackedImageId};
use crate::error::{Result, StackerError};

impl ImageJob {
    /// Move the job to `target` at the current time.
    pub fn transition(&mut self, target: JobStatus) -> Result<()> {
        self.transition_at(target, now())
    }

    /// Move the job to `target`, recording `at` as the transition time.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` when the edge does not exist, including
    ///   re-entering the current status.
    /// - `PreconditionFailed` when the job does not satisfy the entry
    ///   requirements of `target`, or `at` predates a recorded timestamp.
    pub fn transition_at(&mut self, target: JobStatus, at: DateTime<Utc>) -> Result<()> {
        let at = store_time(at);
        check_entry(self, target, at)?;

        match target {
            JobStatus::Downloaded => self.downloaded_at = Some(at),
            JobStatus::Stacked => self.processed_at = Some(at),
            JobStatus::Pending | JobStatus::Processing | JobStatus::Failed => {}
        }
        tracing::debug!(
            job_id = %self.id,
            from = %self.status,
            to = %target,
            "job transition applied"
        );
        self.status = target;
        Ok(())
    }

    /// Record where the sub-exposure landed and enter `Downloaded`.
    pub fn mark_downloaded(&mut self, file_path: impl Into<String>) -> Result<()> {
        self.apply(|job| {
            job.file_path = Some(file_path.into());
            job.transition(JobStatus::Downloaded)
        })
    }

    pub fn mark_processing(&mut self) -> Result<()> {
        self.transition(JobStatus::Processing)
    }

    /// Link the job to its stacked image and enter `Stacked`.
    pub fn mark_stacked(&mut self, stacked_image_id: StackedImageId) -> Result<()> {
        self.apply(|job| {
            job.stacked_image_id = Some(stacked_image_id);
            job.transition(JobStatus::Stacked)
        })
    }

    /// Record the failure reason and enter `Failed`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.apply(|job| {
            job.error = Some(error.into());
            job.transition(JobStatus::Failed)
        })
    }

    fn apply(&mut self, f: impl FnOnce(&mut ImageJob) -> Result<()>) -> Result<()> {
        let mut draft = self.clone();
        f(&mut draft)?;
        *self = draft;
        Ok(())
    }
}

/// Check that `job` may enter `target` at `at`, without touching it.
fn check_entry(job: &ImageJob, target: JobStatus, at: DateTime<Utc>) -> Result<()> {
    if !job.status.can_transition_to(target) {
        return Err(StackerError::invalid_transition(job.status, target));
    }
    if target != JobStatus::Failed && job.error.is_some() {
        return Err(StackerError::precondition(format!(
            "job {} carries an error and cannot enter {}",
            job.id, target
        )));
    }
    if target != JobStatus::Stacked && job.stacked_image_id.is_some() {
        return Err(StackerError::precondition(format!(
            "job {} references a stacked image and cannot enter {}",
            job.id, target
        )));
    }
    if at < job.latest_timestamp() {
        return Err(StackerError::precondition(format!(
            "transition time {} is earlier than the job's last recorded time {}",
            at.to_rfc3339(),
            job.latest_timestamp().to_rfc3339()
        )));
    }

    match target {
        JobStatus::Downloaded => {
            if job.file_path.as_deref().map_or(true, str::is_empty) {
                return Err(StackerError::precondition(
                    "a file path is required to enter downloaded",
                ));
            }
            if job.downloaded_at.is_some() {
                return Err(StackerError::precondition("job was already downloaded"));
            }
        }
        JobStatus::Stacked => {
            if job.stacked_image_id.is_none() {
                return Err(StackerError::precondition(
                    "a stacked image is required to enter stacked",
                ));
            }
            if job.processed_at.is_some() {
                return Err(StackerError::precondition("job was already processed"));
            }
        }
        JobStatus::Failed => {
            if job.error.as_deref().map_or(true, |e| e.trim().is_empty()) {
                return Err(StackerError::precondition(
                    "a non-empty error is required to enter failed",
                ));
            }
        }
        JobStatus::Pending | JobStatus::Processing => {}
    }

    Ok(())
}

/// Check a proposed update against the persisted job.
///
/// Accepts exactly the proposals that `persisted` reaches through one legal
/// transition: identity unchanged, set-once fields unchanged once set, and
/// the proposed status entered with its requirements met.
pub fn check_update(persisted: &ImageJob, proposed: &ImageJob) -> Result<()> {
    if proposed.id != persisted.id
        || proposed.acquired_image_id != persisted.acquired_image_id
        || proposed.created_at != persisted.created_at
    {
        return Err(StackerError::precondition(format!(
            "identity of job {} cannot change",
            persisted.id
        )));
    }

    let set_once = [
        ("file_path", persisted.file_path.is_some() && proposed.file_path != persisted.file_path),
        ("error", persisted.error.is_some() && proposed.error != persisted.error),
        (
            "downloaded_at",
            persisted.downloaded_at.is_some() && proposed.downloaded_at != persisted.downloaded_at,
        ),
        (
            "processed_at",
            persisted.processed_at.is_some() && proposed.processed_at != persisted.processed_at,
        ),
        (
            "stacked_image_id",
            persisted.stacked_image_id.is_some()
                && proposed.stacked_image_id != persisted.stacked_image_id,
        ),
    ];
    if let Some((field, _)) = set_once.iter().find(|(_, changed)| *changed) {
        return Err(StackerError::precondition(format!(
            "{} of job {} is already set and cannot change",
            field, persisted.id
        )));
    }

    // Replay the transition on the persisted row with the caller's inputs and
    // the timestamp the proposal recorded; the result must match the proposal.
    let at = match proposed.status {
        JobStatus::Downloaded => proposed.downloaded_at,
        JobStatus::Stacked => proposed.processed_at,
        _ => None,
    }
    .unwrap_or_else(|| persisted.latest_timestamp());

    let mut expected = persisted.clone();
    expected.file_path = proposed.file_path.clone();
    expected.error = proposed.error.clone();
    expected.stacked_image_id = proposed.stacked_image_id;
    expected.transition_at(proposed.status, at)?;
    expected.revision = proposed.revision;

    if expected != *proposed {
        return Err(StackerError::precondition(format!(
            "update of job {} changes fields the {} transition does not set",
            persisted.id, proposed.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::JobId;
    use chrono::Duration;

    fn pending() -> ImageJob {
        ImageJob {
            id: JobId(1),
            acquired_image_id: 42,
            status: JobStatus::Pending,
            file_path: None,
            error: None,
            created_at: now() - Duration::seconds(10),
            downloaded_at: None,
            processed_at: None,
            stacked_image_id: None,
            revision: 0,
        }
    }

    #[test]
    fn test_rejected_transition_leaves_job_untouched() {
        let mut job = pending();
        let before = job.clone();
        let err = job.transition(JobStatus::Downloaded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        assert_eq!(job, before);

        let err = job.mark_stacked(StackedImageId(3)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert_eq!(job, before);
    }

    #[test]
    fn test_reentrant_transition_is_invalid() {
        let mut job = pending();
        job.mark_downloaded("/tmp/42.fits").unwrap();
        let err = job.transition(JobStatus::Downloaded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_empty_error_cannot_fail_job() {
        let mut job = pending();
        let err = job.mark_failed("   ").unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_failed_keeps_recorded_fields() {
        let mut job = pending();
        job.mark_downloaded("/tmp/42.fits").unwrap();
        let downloaded_at = job.downloaded_at;
        job.mark_failed("checksum mismatch").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.file_path.as_deref(), Some("/tmp/42.fits"));
        assert_eq!(job.downloaded_at, downloaded_at);
    }

    #[test]
    fn test_error_blocks_non_failed_entry() {
        let mut job = pending();
        job.file_path = Some("/tmp/42.fits".into());
        job.error = Some("stale".into());
        let err = job.transition(JobStatus::Downloaded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }

    #[test]
    fn test_stacked_link_blocks_other_entry() {
        let mut job = pending();
        job.file_path = Some("/tmp/42.fits".into());
        job.stacked_image_id = Some(StackedImageId(9));
        let err = job.transition(JobStatus::Downloaded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }

    #[test]
    fn test_time_cannot_go_backwards() {
        let mut job = pending();
        job.file_path = Some("/tmp/42.fits".into());
        let earlier = job.created_at - Duration::seconds(1);
        let err = job.transition_at(JobStatus::Downloaded, earlier).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        assert!(job.downloaded_at.is_none());
    }

    #[test]
    fn test_check_update_accepts_single_transition() {
        let persisted = pending();
        let mut proposed = persisted.clone();
        proposed.mark_downloaded("/tmp/42.fits").unwrap();
        assert!(check_update(&persisted, &proposed).is_ok());
    }

    #[test]
    fn test_check_update_rejects_skipped_state() {
        let persisted = pending();
        let mut proposed = persisted.clone();
        proposed.mark_downloaded("/tmp/42.fits").unwrap();
        proposed.mark_processing().unwrap();
        let err = check_update(&persisted, &proposed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_check_update_rejects_unchanged_status() {
        let persisted = pending();
        let err = check_update(&persisted, &persisted.clone()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_check_update_rejects_identity_change() {
        let persisted = pending();
        let mut proposed = persisted.clone();
        proposed.mark_downloaded("/tmp/42.fits").unwrap();
        proposed.acquired_image_id = 43;
        let err = check_update(&persisted, &proposed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }

    #[test]
    fn test_check_update_rejects_rewritten_file_path() {
        let mut persisted = pending();
        persisted.mark_downloaded("/tmp/42.fits").unwrap();
        let mut proposed = persisted.clone();
        proposed.file_path = Some("/tmp/other.fits".into());
        proposed.mark_processing().unwrap();
        let err = check_update(&persisted, &proposed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }

    #[test]
    fn test_check_update_rejects_smuggled_timestamp() {
        let mut persisted = pending();
        persisted.mark_downloaded("/tmp/42.fits").unwrap();
        let mut proposed = persisted.clone();
        proposed.mark_processing().unwrap();
        proposed.processed_at = Some(now());
        let err = check_update(&persisted, &proposed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }
}
