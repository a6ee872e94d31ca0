use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Render not found: {0}")]
    RenderNotFound(String),

    #[error("Job {job_id} has no block {block}")]
    InvalidBlock { job_id: JobId, block: usize },

    #[error("Job {job_id} block {block} has no task {task}")]
    InvalidTask {
        job_id: JobId,
        block: usize,
        task: usize,
    },

    #[error("Job depends on unknown job {0}")]
    UnknownDependency(JobId),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job queue at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Live state weight {current} bytes exceeds limit {limit} bytes")]
    WeightLimit { current: usize, limit: usize },

    #[error("Invalid host mask: {0}")]
    InvalidHostMask(#[from] regex::Error),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
