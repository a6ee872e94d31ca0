//! Administrative operations on jobs and users.
//!
//! Each job operation validates the request under the job's own lock before
//! changing anything, so a malformed request leaves state untouched.

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::protocol::{ListenRequest, StopExecution, TasksPos};
use crate::scheduler::aggregate::running_delta;
use crate::scheduler::host_mask::HostMasks;
use crate::scheduler::job::{Job, TaskUpdate};
use crate::scheduler::task::TaskPos;
use crate::scheduler::user::{ErrorPolicy, User};
use crate::scheduler::{JobId, JobSummary, Scheduler};

impl Scheduler {
    /// Run `change` on one job, then publish, persist and propagate the result.
    async fn modify_job<F>(&self, job_id: JobId, now: DateTime<Utc>, change: F) -> Result<TaskUpdate>
    where
        F: FnOnce(&mut Job) -> Result<TaskUpdate>,
    {
        let job = self.job_handle(job_id).await?;
        let (update, record) = {
            let mut job = job.lock().await;
            let update = change(&mut *job)?;
            self.publish(JobSummary::from(&*job), running_delta(&job.user, &update))
                .await;
            (update, job.clone())
        };
        self.apply_update(job_id, &update, Some(record), now).await;
        Ok(update)
    }

    pub async fn skip_tasks(&self, sel: &TasksPos, now: DateTime<Utc>) -> Result<Vec<StopExecution>> {
        let update = self
            .modify_job(sel.job_id, now, |job| job.skip_tasks(sel, now))
            .await?;
        Ok(Self::stop_list(&update))
    }

    /// Return selected tasks to the ready pool. Running ones are stopped.
    pub async fn restart_tasks(
        &self,
        sel: &TasksPos,
        reset_errors: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<StopExecution>> {
        let update = self
            .modify_job(sel.job_id, now, |job| job.restart_tasks(sel, reset_errors, now))
            .await?;
        Ok(Self::stop_list(&update))
    }

    pub async fn restart_error_tasks(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| Ok(job.restart_error_tasks(now)))
            .await?;
        Ok(())
    }

    /// Skip the whole job. It then satisfies its dependents like a done job.
    pub async fn skip_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Vec<StopExecution>> {
        let update = self
            .modify_job(job_id, now, |job| Ok(job.skip_job(now)))
            .await?;
        Ok(Self::stop_list(&update))
    }

    pub async fn pause_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            Ok(TaskUpdate {
                state_change: job.set_paused(true, now),
                ..TaskUpdate::default()
            })
        })
        .await?;
        Ok(())
    }

    pub async fn start_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            Ok(TaskUpdate {
                state_change: job.set_paused(false, now),
                ..TaskUpdate::default()
            })
        })
        .await?;
        Ok(())
    }

    /// Delete a job. It leaves live state at once when nothing runs, otherwise
    /// at the first refresh after its last running task reports.
    pub async fn delete_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            Ok(TaskUpdate {
                state_change: job.mark_deleting(now),
                ..TaskUpdate::default()
            })
        })
        .await?;

        let idle = {
            let summaries = self.summaries.read().await;
            summaries.get(&job_id).is_some_and(|s| s.running == 0)
        };
        if idle {
            self.remove_job(job_id, now).await;
        } else {
            tracing::info!(job_id, "Job deletion deferred until running tasks end");
        }
        Ok(())
    }

    pub async fn set_job_priority(&self, job_id: JobId, priority: u8, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            job.priority = priority;
            job.append_log(now, format!("Priority set to {}", priority));
            Ok(TaskUpdate::default())
        })
        .await?;
        Ok(())
    }

    pub async fn set_job_max_running(
        &self,
        job_id: JobId,
        max: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            job.max_running_tasks = max;
            Ok(TaskUpdate::default())
        })
        .await?;
        Ok(())
    }

    pub async fn set_job_hosts_mask(
        &self,
        job_id: JobId,
        include: &str,
        exclude: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            job.set_hosts_mask(include, exclude)?;
            Ok(TaskUpdate::default())
        })
        .await?;
        Ok(())
    }

    pub async fn reset_error_hosts(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        self.modify_job(job_id, now, |job| {
            job.reset_error_hosts(now);
            Ok(TaskUpdate::default())
        })
        .await?;
        Ok(())
    }

    /// Hosts the job currently avoids under its owner's policy.
    pub async fn job_avoided_hosts(&self, job_id: JobId) -> Result<Vec<String>> {
        let job = self.job_handle(job_id).await?;
        let user = job.lock().await.user.clone();
        let policy = self.user_policy(&user).await;
        let hosts = job.lock().await.avoided_hosts(&policy);
        Ok(hosts)
    }

    /// Subscribe or unsubscribe an address to a task's live output.
    pub async fn listen(&self, req: &ListenRequest) -> Result<()> {
        let job = self.job_handle(req.job_id).await?;
        job.lock()
            .await
            .listen(req.block, req.task, &req.address, req.subscribe)?;
        tracing::debug!(
            job_id = req.job_id,
            block = req.block,
            task = req.task,
            address = %req.address,
            subscribe = req.subscribe,
            "Listener changed"
        );
        Ok(())
    }

    /// Task log from the live job, or from the store once the job is gone.
    pub async fn task_log(&self, pos: TaskPos) -> Result<Vec<String>> {
        if let Ok(job) = self.job_handle(pos.job_id).await {
            return job.lock().await.task_log(pos.block, pos.task);
        }
        self.store
            .load_task_log(pos)
            .await?
            .ok_or(SchedulerError::JobNotFound(pos.job_id))
    }

    /// Change one user, persisting it when permanent.
    async fn modify_user<F>(&self, name: &str, change: F) -> Result<User>
    where
        F: FnOnce(&mut User) -> Result<()>,
    {
        let user = {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(name)
                .ok_or_else(|| SchedulerError::UserNotFound(name.to_string()))?;
            change(user)?;
            user.clone()
        };
        if user.permanent {
            self.store.save_user(&user).await?;
        }
        Ok(user)
    }

    /// Permanent users are stored and survive having no jobs.
    pub async fn set_user_permanent(&self, name: &str, permanent: bool, now: DateTime<Utc>) -> Result<()> {
        self.modify_user(name, |u| {
            u.set_permanent(permanent, now);
            Ok(())
        })
        .await?;
        if !permanent {
            self.store.delete_user(name).await?;
        }
        tracing::info!(user = name, permanent, "User permanence changed");
        Ok(())
    }

    pub async fn set_user_priority(&self, name: &str, priority: u8) -> Result<()> {
        self.modify_user(name, |u| {
            u.priority = priority;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_user_max_running(&self, name: &str, max: Option<u32>) -> Result<()> {
        self.modify_user(name, |u| {
            u.max_running_tasks = max;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_user_error_policy(&self, name: &str, policy: ErrorPolicy) -> Result<()> {
        let user = self
            .modify_user(name, |u| {
                u.policy = policy;
                Ok(())
            })
            .await?;
        tracing::info!(user = name, policy = %user.policy.errors_solving(), "User error policy changed");
        Ok(())
    }

    pub async fn set_user_hosts_mask(&self, name: &str, include: &str, exclude: &str) -> Result<()> {
        let hosts = HostMasks::new(include, exclude)?;
        self.modify_user(name, |u| {
            u.hosts = hosts;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_user_jobs_life_time(&self, name: &str, secs: Option<i64>) -> Result<()> {
        self.modify_user(name, |u| {
            u.jobs_life_time = secs;
            Ok(())
        })
        .await?;
        Ok(())
    }
}
