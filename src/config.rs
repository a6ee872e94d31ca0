use serde::{Deserialize, Serialize};

/// What happens to a job waiting on a dependency that failed or was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DependFailurePolicy {
    /// Dependents stay `DependPending` until the dependency is restarted and done.
    #[default]
    Hold,
    /// Dependents turn `Error` while any dependency is failed or gone.
    Cascade,
}

impl std::str::FromStr for DependFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hold" => Ok(DependFailurePolicy::Hold),
            "cascade" => Ok(DependFailurePolicy::Cascade),
            other => Err(format!("unknown depend failure policy: {}", other)),
        }
    }
}

/// Policy a freshly created (ephemeral) user starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct UserDefaults {
    pub priority: u8,
    /// `None` means no limit.
    pub max_running_tasks: Option<u32>,
    pub errors_retries: u32,
    pub errors_avoid_host: u32,
    pub errors_task_same_host: u32,
    /// Seconds. Zero disables forgiving.
    pub errors_forgive_time: i64,
    /// Seconds. `None` means jobs live until deleted.
    pub jobs_life_time: Option<i64>,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            priority: 99,
            max_running_tasks: None,
            errors_retries: 3,
            errors_avoid_host: 3,
            errors_task_same_host: 2,
            errors_forgive_time: 18_000,
            jobs_life_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Renders silent for longer than this are marked offline.
    pub render_timeout_secs: i64,
    /// Period of the refresh sweep.
    pub refresh_interval_ms: u64,
    /// Maximum number of live jobs.
    pub max_jobs: usize,
    /// Maximum approximate live-state weight before new jobs are refused.
    pub max_weight_bytes: Option<usize>,
    /// Lines kept per task and job log.
    pub task_log_max_lines: usize,
    pub depend_failure: DependFailurePolicy,
    /// Fraction of terminally failed tasks that turns a job `Error`.
    pub job_error_fraction: f32,
    pub user_defaults: UserDefaults,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            render_timeout_secs: 30,
            refresh_interval_ms: 1000,
            max_jobs: 10_000,
            max_weight_bytes: None,
            task_log_max_lines: 100,
            depend_failure: DependFailurePolicy::Hold,
            job_error_fraction: 1.0,
            user_defaults: UserDefaults::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_render_timeout(mut self, secs: i64) -> Self {
        self.render_timeout_secs = secs;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_max_weight(mut self, bytes: usize) -> Self {
        self.max_weight_bytes = Some(bytes);
        self
    }

    pub fn with_depend_failure(mut self, policy: DependFailurePolicy) -> Self {
        self.depend_failure = policy;
        self
    }

    pub fn with_job_error_fraction(mut self, fraction: f32) -> Self {
        self.job_error_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_user_defaults(mut self, defaults: UserDefaults) -> Self {
        self.user_defaults = defaults;
        self
    }
}
