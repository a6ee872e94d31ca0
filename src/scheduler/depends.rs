//! Dependency resolution between jobs.
//!
//! A job with declared dependencies may not dispatch until every dependency
//! is complete. The resolver never looks inside another job: it reads a
//! published state table, so it only ever holds the lock of the job it updates.

use serde::{Deserialize, Serialize};

use crate::config::DependFailurePolicy;
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependStatus {
    Satisfied,
    Pending,
    /// A dependency failed or disappeared and the policy cascades.
    Failed,
}

/// Evaluate `job`'s dependencies against `state_of`, which returns `None` for
/// jobs that no longer exist. Stores and returns the new status.
///
/// A dependency observed complete once is remembered in `depends_done`, so
/// its later expiry or deletion does not count as a failure.
pub fn check_depends<F>(job: &mut Job, policy: DependFailurePolicy, state_of: F) -> DependStatus
where
    F: Fn(JobId) -> Option<JobState>,
{
    let mut pending = false;
    let mut failed = false;
    for &dep in &job.depends {
        if job.depends_done.contains(&dep) {
            continue;
        }
        match state_of(dep) {
            Some(state) if state.is_complete() => {
                job.depends_done.insert(dep);
            }
            Some(JobState::Error) | Some(JobState::Deleted) | None => failed = true,
            Some(_) => pending = true,
        }
    }

    let status = match (failed, pending, policy) {
        (true, _, DependFailurePolicy::Cascade) => DependStatus::Failed,
        (true, _, DependFailurePolicy::Hold) | (false, true, _) => DependStatus::Pending,
        (false, false, _) => DependStatus::Satisfied,
    };

    if status != job.depend_status {
        tracing::info!(
            job_id = job.id,
            from = ?job.depend_status,
            to = ?status,
            "Job dependency status changed"
        );
        job.depend_status = status;
    }
    status
}
