//! Tests for the image job state machine.
//!
//! Tests cover:
//! - The transition table over every status pair
//! - Entry requirements of downloaded, stacked and failed
//! - The full processing path of one acquisition
//! - Update checks between a stored job and a proposed one

use chrono::{Duration, Utc};
use stacker_core::error::ErrorCode;
use stacker_core::jobs::{check_update, store_time, ImageJob, JobId, JobStatus, StackedImageId};

fn pending_job(acquired_image_id: i64) -> ImageJob {
    ImageJob {
        id: JobId(1),
        acquired_image_id,
        status: JobStatus::Pending,
        file_path: None,
        error: None,
        created_at: store_time(Utc::now() - Duration::seconds(10)),
        downloaded_at: None,
        processed_at: None,
        stacked_image_id: None,
        revision: 0,
    }
}

/// A job sitting in `status` with every field that status requires.
fn job_in(status: JobStatus) -> ImageJob {
    let mut job = pending_job(7);
    match status {
        JobStatus::Pending => {}
        JobStatus::Downloaded => job.mark_downloaded("/tmp/7.fits").unwrap(),
        JobStatus::Processing => {
            job.mark_downloaded("/tmp/7.fits").unwrap();
            job.mark_processing().unwrap();
        }
        JobStatus::Stacked => {
            job.mark_downloaded("/tmp/7.fits").unwrap();
            job.mark_processing().unwrap();
            job.mark_stacked(StackedImageId(3)).unwrap();
        }
        JobStatus::Failed => job.mark_failed("download timed out").unwrap(),
    }
    job
}

/// Drive `job` into `target` supplying whatever the target requires.
fn drive(job: &mut ImageJob, target: JobStatus) -> stacker_core::Result<()> {
    match target {
        JobStatus::Downloaded => job.mark_downloaded("/tmp/7.fits"),
        JobStatus::Processing => job.mark_processing(),
        JobStatus::Stacked => job.mark_stacked(StackedImageId(3)),
        JobStatus::Failed => job.mark_failed("worker lost"),
        JobStatus::Pending => job.transition(JobStatus::Pending),
    }
}

// ============================================================================
// Transition Table
// ============================================================================

#[test]
fn test_transition_table_is_exhaustive() {
    for from in JobStatus::ALL {
        for to in JobStatus::ALL {
            let mut job = job_in(from);
            let before = job.clone();
            let result = drive(&mut job, to);

            let allowed = (to == JobStatus::Failed && !from.is_terminal()) || from.next() == Some(to);
            if allowed {
                assert!(result.is_ok(), "{} -> {} should succeed: {:?}", from, to, result);
                assert_eq!(job.status, to);
            } else {
                let err = result.unwrap_err();
                assert_eq!(err.code(), ErrorCode::InvalidTransition, "{} -> {}", from, to);
                assert_eq!(job, before, "rejected {} -> {} must not mutate the job", from, to);
            }
        }
    }
}

#[test]
fn test_terminal_statuses() {
    assert!(JobStatus::Stacked.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(!JobStatus::Processing.is_terminal());
    assert!(JobStatus::Failed.allowed_targets().is_empty());
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_full_processing_path() {
    let mut job = pending_job(42);

    job.mark_downloaded("/tmp/42.fits").unwrap();
    assert_eq!(job.status, JobStatus::Downloaded);
    assert_eq!(job.file_path.as_deref(), Some("/tmp/42.fits"));
    assert!(job.downloaded_at.is_some());

    job.mark_processing().unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    job.mark_stacked(StackedImageId(5)).unwrap();
    assert_eq!(job.status, JobStatus::Stacked);
    assert_eq!(job.stacked_image_id, Some(StackedImageId(5)));
    assert!(job.downloaded_at.is_some());
    assert!(job.processed_at.is_some());
    assert!(job.processed_at >= job.downloaded_at);
    assert!(job.error.is_none());
}

#[test]
fn test_pending_cannot_skip_to_stacked() {
    let mut job = pending_job(42);
    let err = job.mark_stacked(StackedImageId(5)).unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidTransition);
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.stacked_image_id.is_none());
}

// ============================================================================
// Entry Requirements
// ============================================================================

#[test]
fn test_downloaded_requires_file_path() {
    let mut job = pending_job(1);
    let err = job.transition(JobStatus::Downloaded).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);

    let err = job.mark_downloaded("").unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    assert!(job.file_path.is_none());
}

#[test]
fn test_failed_requires_error() {
    let mut job = pending_job(1);
    let err = job.mark_failed("   ").unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    assert!(job.error.is_none());
    assert_eq!(job.status, JobStatus::Pending);
}

#[test]
fn test_transition_time_cannot_go_backwards() {
    let mut job = pending_job(1);
    job.file_path = Some("/tmp/1.fits".to_string());
    let earlier = job.created_at - Duration::seconds(1);

    let err = job.transition_at(JobStatus::Downloaded, earlier).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    assert!(job.downloaded_at.is_none());
}

#[test]
fn test_failing_from_processing_keeps_download() {
    let mut job = job_in(JobStatus::Processing);
    job.mark_failed("calibration frames missing").unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.downloaded_at.is_some());
    assert!(job.processed_at.is_none());
    assert_eq!(job.error.as_deref(), Some("calibration frames missing"));
}

// ============================================================================
// Update Checks
// ============================================================================

#[test]
fn test_check_update_accepts_one_transition() {
    let persisted = pending_job(9);
    let mut proposed = persisted.clone();
    proposed.mark_downloaded("/tmp/9.fits").unwrap();

    assert!(check_update(&persisted, &proposed).is_ok());
}

#[test]
fn test_check_update_rejects_identity_change() {
    let persisted = pending_job(9);
    let mut proposed = persisted.clone();
    proposed.mark_downloaded("/tmp/9.fits").unwrap();
    proposed.acquired_image_id = 10;

    let err = check_update(&persisted, &proposed).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
}

#[test]
fn test_check_update_rejects_skipped_status() {
    let persisted = pending_job(9);
    let mut proposed = persisted.clone();
    proposed.file_path = Some("/tmp/9.fits".to_string());
    proposed.status = JobStatus::Processing;

    let err = check_update(&persisted, &proposed).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);
}

#[test]
fn test_check_update_rejects_rewritten_file_path() {
    let persisted = job_in(JobStatus::Downloaded);
    let mut proposed = persisted.clone();
    proposed.mark_processing().unwrap();
    proposed.file_path = Some("/tmp/other.fits".to_string());

    let err = check_update(&persisted, &proposed).unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
}

#[test]
fn test_check_update_rejects_stray_field() {
    let persisted = pending_job(9);
    let mut proposed = persisted.clone();
    proposed.mark_failed("disk full").unwrap();
    proposed.processed_at = Some(store_time(Utc::now()));

    assert!(check_update(&persisted, &proposed).is_err());
}
