//! Scheduling core: jobs, blocks, tasks, users, renders and the operations
//! tying them together.
//!
//! [`Scheduler`] is the scheduling-state context. Every job sits behind its
//! own lock, and no code path holds two job locks at once. The other shared
//! tables are locked briefly, always in the order summaries, users, renders.
//! A job lock may be held while taking them, never the other way round, so a
//! job's summary is published before its lock is released.

pub mod admin;
pub mod aggregate;
pub mod block;
pub mod depends;
pub mod dispatch;
pub mod error_hosts;
pub mod host_mask;
pub mod job;
pub mod render;
pub mod task;
pub mod user;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::protocol::{Event, OutputNotice, Response, StopExecution};
use crate::store::Store;
use crate::weight::{JobWeight, Weigh};

pub use aggregate::RefreshReport;
pub use block::{BlockSpec, BlockTasks, TaskSpec};
pub use job::{BlockOrder, Job, JobSpec, JobState};
pub use render::{Render, RenderProfile, RenderState};
pub use task::{TaskPos, TaskState};
pub use user::{ErrorPolicy, User};

use render::RenderPool;
use user::UserPool;

pub type JobId = u64;

const NOTICE_CHANNEL_CAPACITY: usize = 1024;

/// Published view of a job, readable without taking its lock.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub user: String,
    pub priority: u8,
    pub state: JobState,
    pub running: usize,
    pub percent: u8,
    pub depends: BTreeSet<JobId>,
    pub weight: usize,
    pub time_created: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            user: job.user.clone(),
            priority: job.priority,
            state: job.state,
            running: job.counters.running,
            percent: job.counters.percent,
            depends: job.depends.clone(),
            weight: job.calc_weight(),
            time_created: job.time_created,
        }
    }
}

/// Approximate memory held by live state.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StateWeight {
    pub jobs: JobWeight,
    pub users: usize,
    pub renders: usize,
    pub total: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    jobs: RwLock<BTreeMap<JobId, Arc<Mutex<Job>>>>,
    summaries: RwLock<BTreeMap<JobId, JobSummary>>,
    users: RwLock<UserPool>,
    renders: RwLock<RenderPool>,
    /// Serializes dispatch so user ceilings hold across concurrent offers.
    solve_lock: Mutex<()>,
    store: Arc<dyn Store>,
    notices: broadcast::Sender<OutputNotice>,
    next_job_id: AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn Store>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            renders: RwLock::new(RenderPool::new(config.render_timeout_secs)),
            config,
            jobs: RwLock::new(BTreeMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
            users: RwLock::new(UserPool::new()),
            solve_lock: Mutex::new(()),
            store,
            notices,
            next_job_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Receive listener notices for task output and terminal states.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<OutputNotice> {
        self.notices.subscribe()
    }

    /// Load permanent users and jobs from the store. Tasks recorded as
    /// running are restarted, since their renders are unknown.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize> {
        for name in self.store.user_names().await? {
            if let Some(user) = self.store.load_user(&name).await? {
                self.users.write().await.insert(user);
            }
        }

        let mut restored = 0;
        for id in self.store.job_ids().await? {
            let Some(mut job) = self.store.load_job(id).await? else {
                continue;
            };
            for block in &mut job.blocks {
                for task in &mut block.tasks {
                    if task.state() == TaskState::Running {
                        task.restart(false);
                    }
                }
            }
            job.refresh_state(now);
            self.next_job_id.fetch_max(id + 1, Ordering::SeqCst);
            self.admit(job).await;
            restored += 1;
        }
        tracing::info!(jobs = restored, "Restored jobs from store");
        self.refresh(now).await;
        Ok(restored)
    }

    /// Admit a new job. Dependencies must name live jobs.
    pub async fn add_job(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId> {
        {
            let summaries = self.summaries.read().await;
            if summaries.len() >= self.config.max_jobs {
                return Err(SchedulerError::QueueFull(self.config.max_jobs));
            }
            if let Some(limit) = self.config.max_weight_bytes {
                let current: usize = summaries.values().map(|s| s.weight).sum();
                if current >= limit {
                    return Err(SchedulerError::WeightLimit { current, limit });
                }
            }
            if let Some(unknown) = spec.depends.iter().find(|d| !summaries.contains_key(d)) {
                return Err(SchedulerError::UnknownDependency(*unknown));
            }
        }

        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(
            id,
            &spec,
            now,
            self.config.task_log_max_lines,
            self.config.job_error_fraction,
        )?;
        let record = job.clone();
        self.admit(job).await;
        tracing::info!(job_id = id, name = %spec.name, user = %spec.user, "Job added");

        if let Err(e) = self.store.save_job(&record).await {
            tracing::error!(job_id = id, error = %e, "Failed to save job");
        }
        if !record.depends.is_empty() {
            self.resolve_job(id, now).await;
        }
        Ok(id)
    }

    /// Make a job live. Its owner is created and counted in the same critical
    /// section that publishes the summary, so a concurrent refresh never sees
    /// the user without the job.
    async fn admit(&self, job: Job) {
        let id = job.id;
        let summary = JobSummary::from(&job);
        {
            let mut summaries = self.summaries.write().await;
            let mut users = self.users.write().await;
            let user = users.get_or_create(&job.user, &self.config.user_defaults);
            user.jobs_num += 1;
            summaries.insert(id, summary);
        }
        self.jobs.write().await.insert(id, Arc::new(Mutex::new(job)));
    }

    pub(crate) async fn job_handle(&self, id: JobId) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::JobNotFound(id))
    }

    /// Replace a job's published summary, adjusting its owner's running-task
    /// counter by `running_delta` in the same critical section.
    pub(crate) async fn publish(&self, summary: JobSummary, running_delta: Option<(String, isize)>) {
        let mut summaries = self.summaries.write().await;
        if let Some((user, delta)) = running_delta {
            let mut users = self.users.write().await;
            for _ in 0..delta.unsigned_abs() {
                if delta > 0 {
                    users.task_started(&user);
                } else {
                    users.task_finished(&user);
                }
            }
        }
        summaries.insert(summary.id, summary);
    }

    /// Consistent copy of one job.
    pub async fn job_snapshot(&self, id: JobId) -> Result<Job> {
        let job = self.job_handle(id).await?;
        let snapshot = job.lock().await.clone();
        Ok(snapshot)
    }

    pub async fn job_summaries(&self) -> Vec<JobSummary> {
        self.summaries.read().await.values().cloned().collect()
    }

    pub async fn job_state(&self, id: JobId) -> Option<JobState> {
        self.summaries.read().await.get(&id).map(|s| s.state)
    }

    pub async fn user(&self, name: &str) -> Option<User> {
        self.users.read().await.get(name).cloned()
    }

    pub async fn users(&self) -> Vec<User> {
        self.users.read().await.all().into_iter().cloned().collect()
    }

    pub async fn render(&self, name: &str) -> Option<Render> {
        self.renders.read().await.get(name).cloned()
    }

    pub async fn renders(&self) -> Vec<Render> {
        self.renders.read().await.all().into_iter().cloned().collect()
    }

    pub(crate) async fn user_policy(&self, name: &str) -> ErrorPolicy {
        self.users
            .read()
            .await
            .get(name)
            .map(|u| u.policy)
            .unwrap_or_else(|| ErrorPolicy::from(&self.config.user_defaults))
    }

    pub async fn register_render(&self, profile: RenderProfile, now: DateTime<Utc>) {
        self.renders.write().await.register(profile, now);
    }

    pub async fn render_heartbeat(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.renders.write().await.heartbeat(name, now)
    }

    /// Best-effort weight of the whole live state. Jobs are weighed one at a
    /// time, so the total may mix slightly different moments.
    pub async fn total_weight(&self) -> StateWeight {
        let handles: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut w = StateWeight::default();
        for job in handles {
            w.jobs += job.lock().await.weight();
        }
        w.users = self
            .users
            .read()
            .await
            .all()
            .iter()
            .map(|u| u.calc_weight())
            .sum();
        w.renders = self.renders.read().await.calc_weight();
        w.total = w.jobs.total + w.users + w.renders;
        w
    }

    /// Dispatch one inbound event.
    pub async fn handle(&self, event: Event, now: DateTime<Utc>) -> Response {
        let result = match event {
            Event::WorkerOffer(profile) => {
                let name = profile.name.clone();
                let lost = self.renders.write().await.register(profile, now).current;
                if let Some(assignment) = lost {
                    // Offering while holding an execution means the render lost it.
                    tracing::warn!(
                        render = %name,
                        task = %assignment.pos,
                        "Render offered itself with a task assigned"
                    );
                    self.fail_execution(&name, assignment, "render offered itself while running", now)
                        .await;
                }
                self.solve(&name, now).await.map(|exec| match exec {
                    Some(exec) => Response::Dispatch(exec),
                    None => Response::NoWork,
                })
            }
            Event::Heartbeat { render } => self
                .render_heartbeat(&render, now)
                .await
                .map(|_| Response::Ack),
            Event::TaskReport(report) => self
                .update_task_state(&report, now)
                .await
                .map(|_| Response::Ack),
            Event::AdminSkip(sel) => self.skip_tasks(&sel, now).await.map(stop_response),
            Event::AdminRestart(req) => self
                .restart_tasks(&req.tasks, req.reset_errors, now)
                .await
                .map(stop_response),
            Event::ListenRequest(req) => self.listen(&req).await.map(|_| Response::Ack),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Event rejected");
            Response::Rejected {
                reason: e.to_string(),
            }
        })
    }
}

fn stop_response(executions: Vec<StopExecution>) -> Response {
    if executions.is_empty() {
        Response::Ack
    } else {
        Response::Stop { executions }
    }
}
