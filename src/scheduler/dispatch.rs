//! Matching a render that offers itself to the best ready task.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::protocol::TaskExec;
use crate::scheduler::render::Assignment;
use crate::scheduler::{JobId, JobSummary, Scheduler};

impl Scheduler {
    /// Dispatchable jobs in solve order: user priority, then job priority
    /// (both highest first), then job id.
    async fn solve_candidates(&self) -> Vec<(JobId, String)> {
        let summaries = self.summaries.read().await;
        let users = self.users.read().await;
        let mut candidates: Vec<(Reverse<u8>, Reverse<u8>, JobId, String)> = summaries
            .values()
            .filter(|s| s.state.is_dispatchable())
            .map(|s| {
                let user_priority = users.get(&s.user).map(|u| u.priority).unwrap_or(0);
                (
                    Reverse(user_priority),
                    Reverse(s.priority),
                    s.id,
                    s.user.clone(),
                )
            })
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .map(|(_, _, id, user)| (id, user))
            .collect()
    }

    /// Find a task for render `name`. `Ok(None)` means no work, which is the
    /// normal answer when the farm is balanced.
    ///
    /// Jobs are tried in solve order; each is locked only while it is being
    /// examined, and the dispatch happens under the lock of the winning job.
    ///
    /// Offers are solved one at a time farm-wide. A user's ceiling spans all
    /// of their jobs, so the check against `running_tasks_num` and the
    /// increment that follows a dispatch must not interleave with another
    /// offer. Reports and admin operations do not take this lock and still
    /// contend only on the job they touch.
    pub async fn solve(&self, name: &str, now: DateTime<Utc>) -> Result<Option<TaskExec>> {
        let _solving = self.solve_lock.lock().await;

        let profile = {
            let renders = self.renders.read().await;
            let render = renders
                .get(name)
                .ok_or_else(|| SchedulerError::RenderNotFound(name.to_string()))?;
            if !render.is_idle() {
                tracing::debug!(render = name, state = %render.state, "Render not idle, no work");
                return Ok(None);
            }
            render.profile.clone()
        };

        for (job_id, user_name) in self.solve_candidates().await {
            let (policy, user_allows) = {
                let users = self.users.read().await;
                match users.get(&user_name) {
                    Some(user) => (
                        user.policy,
                        user.below_ceiling() && user.hosts.allows(&profile.name),
                    ),
                    None => continue,
                }
            };
            if !user_allows {
                continue;
            }

            let Ok(job) = self.job_handle(job_id).await else {
                continue;
            };
            let mut job = job.lock().await;
            let Some(exec) = job.solve(&profile, &policy, now) else {
                continue;
            };
            self.publish(JobSummary::from(&*job), Some((user_name, 1)))
                .await;
            self.renders.write().await.assign(
                &profile.name,
                Assignment {
                    pos: exec.pos(),
                    exec_id: exec.exec_id,
                },
            );
            return Ok(Some(exec));
        }

        tracing::debug!(render = name, "No work for render");
        Ok(None)
    }
}
