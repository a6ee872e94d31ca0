//! Folding task reports into job state, dependency notification, and the
//! periodic refresh sweep.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::protocol::{ReportStatus, StopExecution, TaskReport};
use crate::scheduler::depends::check_depends;
use crate::scheduler::job::{Job, JobState, TaskUpdate};
use crate::scheduler::render::Assignment;
use crate::scheduler::{JobId, JobSummary, Scheduler};

/// What one refresh sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Jobs whose lifetime elapsed during this sweep.
    pub expired: Vec<JobId>,
    /// Jobs removed from live state.
    pub removed: Vec<JobId>,
    /// Ephemeral users dropped for owning no jobs.
    pub users_removed: Vec<String>,
}

/// Whether a state change can matter to jobs depending on this one.
fn affects_dependents(change: Option<(JobState, JobState)>) -> bool {
    change.is_some_and(|(old, new)| {
        let relevant = |s: JobState| s.is_complete() || matches!(s, JobState::Error | JobState::Deleted);
        relevant(old) || relevant(new)
    })
}

/// Running-task change for the owner of a job whose update released executions.
pub(crate) fn running_delta(user: &str, update: &TaskUpdate) -> Option<(String, isize)> {
    (!update.released.is_empty()).then(|| (user.to_string(), -(update.released.len() as isize)))
}

impl Scheduler {
    /// Ingest a render's report for the task it runs.
    ///
    /// Only the owning job is locked. Reports for stale executions are
    /// accepted and ignored.
    pub async fn update_task_state(&self, report: &TaskReport, now: DateTime<Utc>) -> Result<TaskUpdate> {
        let job = self.job_handle(report.job_id).await?;
        let user = {
            let summaries = self.summaries.read().await;
            summaries
                .get(&report.job_id)
                .map(|s| s.user.clone())
                .unwrap_or_default()
        };
        let policy = self.user_policy(&user).await;

        let (update, record) = {
            let mut job = job.lock().await;
            let update = job.update_task_state(report, &policy, now)?;
            if !update.ignored {
                self.publish(JobSummary::from(&*job), running_delta(&job.user, &update))
                    .await;
            }
            let record = (update.state_change.is_some() || !update.finished.is_empty())
                .then(|| job.clone());
            (update, record)
        };
        if !update.ignored {
            self.apply_update(report.job_id, &update, record, now).await;
        }
        Ok(update)
    }

    /// Propagate a job-level update already published under the job lock:
    /// renders, listeners, storage and dependents.
    pub(crate) async fn apply_update(
        &self,
        job_id: JobId,
        update: &TaskUpdate,
        record: Option<Job>,
        now: DateTime<Utc>,
    ) {
        if !update.released.is_empty() {
            let mut renders = self.renders.write().await;
            for r in &update.released {
                renders.release(&r.host, r.exec_id, update.failed);
            }
        }

        for notice in &update.notices {
            // No subscribers is fine: nobody is listening right now.
            let _ = self.notices.send(notice.clone());
        }

        for (pos, log) in &update.finished {
            if let Err(e) = self.store.save_task_log(*pos, log).await {
                tracing::error!(task = %pos, error = %e, "Failed to save task log");
            }
        }
        if let Some(record) = record {
            if let Err(e) = self.store.save_job(&record).await {
                tracing::error!(job_id, error = %e, "Failed to save job");
            }
        }

        if affects_dependents(update.state_change) {
            self.resolve_dependents(job_id, now).await;
        }
    }

    /// Executions released by an administrative change, to be stopped on their renders.
    pub(crate) fn stop_list(update: &TaskUpdate) -> Vec<StopExecution> {
        update
            .released
            .iter()
            .map(|r| StopExecution {
                render: r.host.clone(),
                exec_id: r.exec_id,
            })
            .collect()
    }

    /// Re-evaluate one job's dependencies. Returns its state change.
    pub(crate) async fn resolve_job(&self, job_id: JobId, now: DateTime<Utc>) -> Option<(JobState, JobState)> {
        let job = self.job_handle(job_id).await.ok()?;
        let states: HashMap<JobId, JobState> = {
            let summaries = self.summaries.read().await;
            summaries.iter().map(|(id, s)| (*id, s.state)).collect()
        };

        let (change, record) = {
            let mut job = job.lock().await;
            let seen_done = job.depends_done.len();
            check_depends(&mut job, self.config.depend_failure, |id| states.get(&id).copied());
            let change = job.refresh_state(now);
            self.publish(JobSummary::from(&*job), None).await;
            let record = (change.is_some() || job.depends_done.len() != seen_done)
                .then(|| job.clone());
            (change, record)
        };
        if let Some(record) = record {
            if let Err(e) = self.store.save_job(&record).await {
                tracing::error!(job_id, error = %e, "Failed to save job");
            }
        }
        change
    }

    /// Notify every job depending on `job_id`, and transitively their
    /// dependents when their own state changes. Each dependent is locked on
    /// its own.
    pub(crate) async fn resolve_dependents(&self, job_id: JobId, now: DateTime<Utc>) {
        let mut queue = VecDeque::from([job_id]);
        while let Some(changed) = queue.pop_front() {
            let dependents: Vec<JobId> = self
                .summaries
                .read()
                .await
                .values()
                .filter(|s| s.depends.contains(&changed))
                .map(|s| s.id)
                .collect();
            for dependent in dependents {
                let change = self.resolve_job(dependent, now).await;
                if affects_dependents(change) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    /// Remove a job with nothing running from live state and storage.
    pub(crate) async fn remove_job(&self, job_id: JobId, now: DateTime<Utc>) {
        let removed = self.jobs.write().await.remove(&job_id);
        if removed.is_none() {
            return;
        }
        let owner = self.summaries.write().await.remove(&job_id).map(|s| s.user);
        if let Some(owner) = owner {
            if let Some(user) = self.users.write().await.get_mut(&owner) {
                user.jobs_num = user.jobs_num.saturating_sub(1);
            }
        }
        if let Err(e) = self.store.delete_job(job_id).await {
            tracing::error!(job_id, error = %e, "Failed to delete job from store");
        }
        tracing::info!(job_id, "Job removed");
        self.resolve_dependents(job_id, now).await;
    }

    /// Mark renders with an elapsed heartbeat window offline, failing the task
    /// each one held through the normal error path. Returns the renders.
    pub async fn check_renders(&self, now: DateTime<Utc>) -> Vec<String> {
        let dead = self.renders.write().await.mark_dead(now);
        let mut names = Vec::with_capacity(dead.len());
        for (name, assignment) in dead {
            if let Some(a) = assignment {
                self.fail_execution(&name, a, "render heartbeat timed out", now)
                    .await;
            }
            names.push(name);
        }
        names
    }

    /// Fail the execution `render` was assigned through the normal error path,
    /// then make sure the render no longer points at it.
    pub(crate) async fn fail_execution(
        &self,
        render: &str,
        assignment: Assignment,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let report = TaskReport {
            job_id: assignment.pos.job_id,
            block: assignment.pos.block,
            task: assignment.pos.task,
            exec_id: assignment.exec_id,
            render: render.to_string(),
            status: ReportStatus::Error,
            percent: None,
            activity: Some(reason.to_string()),
            output: None,
        };
        match self.update_task_state(&report, now).await {
            Ok(update) if update.ignored => {
                // The task moved on; just drop the reference.
                self.renders.write().await.release(render, assignment.exec_id, true);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(render, error = %e, "Lost task of render");
                self.renders.write().await.release(render, assignment.exec_id, true);
            }
        }
    }

    /// Periodic sweep over the whole live state: lifetimes, waiting times,
    /// deferred deletions, dependency passes and user counters.
    pub async fn refresh(&self, now: DateTime<Utc>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let lifetimes: HashMap<String, Option<i64>> = self
            .users
            .read()
            .await
            .all()
            .into_iter()
            .map(|u| (u.name.clone(), u.jobs_life_time))
            .collect();
        let handles: Vec<(JobId, _)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, job)| (*id, job.clone()))
            .collect();

        let mut changed = Vec::new();
        let mut removable = Vec::new();
        let mut with_depends = Vec::new();
        for (id, job) in handles {
            let (change, record) = {
                let mut job = job.lock().await;
                let default_lifetime = lifetimes.get(&job.user).copied().flatten();
                let change = if !job.deleting && job.lifetime_expired(now, default_lifetime) {
                    tracing::info!(job_id = id, "Job lifetime elapsed");
                    report.expired.push(id);
                    job.mark_deleting(now)
                } else {
                    job.refresh_state(now)
                };
                if job.deleting && job.running() == 0 {
                    removable.push(id);
                }
                if !job.depends.is_empty() && !job.state.is_complete() {
                    with_depends.push(id);
                }
                self.publish(JobSummary::from(&*job), None).await;
                let record = change.map(|_| job.clone());
                (change, record)
            };
            if let Some(record) = record {
                if let Err(e) = self.store.save_job(&record).await {
                    tracing::error!(job_id = id, error = %e, "Failed to save job");
                }
            }
            if affects_dependents(change) {
                changed.push(id);
            }
        }

        for id in removable {
            self.remove_job(id, now).await;
            report.removed.push(id);
        }
        for id in with_depends {
            if affects_dependents(self.resolve_job(id, now).await) {
                changed.push(id);
            }
        }
        for id in changed {
            self.resolve_dependents(id, now).await;
        }

        {
            let _solving = self.solve_lock.lock().await;
            let summaries = self.summaries.read().await;
            let mut users = self.users.write().await;
            let mut counts: BTreeMap<&str, (u32, u32, u32)> = BTreeMap::new();
            for s in summaries.values() {
                let c = counts.entry(s.user.as_str()).or_default();
                c.0 += 1;
                if s.state == JobState::Running {
                    c.1 += 1;
                }
                c.2 += s.running as u32;
            }
            let names: Vec<String> = users.all().iter().map(|u| u.name.clone()).collect();
            for name in names {
                let (jobs, running_jobs, running_tasks) =
                    counts.get(name.as_str()).copied().unwrap_or_default();
                if let Some(u) = users.get_mut(&name) {
                    u.jobs_num = jobs;
                    u.running_jobs_num = running_jobs;
                    u.running_tasks_num = running_tasks;
                }
            }
            report.users_removed = users.remove_idle_ephemeral();
        }

        tracing::debug!(
            expired = report.expired.len(),
            removed = report.removed.len(),
            "Refresh done"
        );
        report
    }
}
