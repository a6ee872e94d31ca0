use std::collections::BTreeSet;
use std::mem::size_of;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::protocol::{OutputNotice, ReportStatus, TaskExec, TaskReport, TasksPos};
use crate::scheduler::block::{Block, BlockSpec};
use crate::scheduler::depends::DependStatus;
use crate::scheduler::error_hosts::{apply_failure, ErrorHosts};
use crate::scheduler::host_mask::HostMasks;
use crate::scheduler::render::RenderProfile;
use crate::scheduler::task::{Released, TaskPos, TaskState};
use crate::scheduler::user::ErrorPolicy;
use crate::scheduler::JobId;
use crate::weight::{weigh_string, weigh_strings, JobWeight, Weigh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Paused by an administrator.
    Offline,
    /// Start time not reached yet.
    Waiting,
    Ready,
    Running,
    Done,
    Error,
    DependPending,
    /// Skipped as a whole by an administrator.
    Skipped,
    /// Deleted or expired, removed once nothing runs.
    Deleted,
}

impl JobState {
    pub fn is_dispatchable(self) -> bool {
        matches!(self, JobState::Ready | JobState::Running)
    }

    /// Satisfies dependents.
    pub fn is_complete(self) -> bool {
        matches!(self, JobState::Done | JobState::Skipped)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Offline => "offline",
            JobState::Waiting => "waiting",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::DependPending => "depend-pending",
            JobState::Skipped => "skipped",
            JobState::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// Whether blocks run one after another or side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockOrder {
    /// Block `k` starts only when every block before it is done or skipped.
    Sequential,
    Parallel,
}

/// A job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub user: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub block_order: BlockOrder,
    pub blocks: Vec<BlockSpec>,
    #[serde(default)]
    pub max_running_tasks: Option<u32>,
    #[serde(default)]
    pub hosts_mask: String,
    #[serde(default)]
    pub hosts_mask_exclude: String,
    #[serde(default)]
    pub depends: Vec<JobId>,
    #[serde(default)]
    pub wait_until: Option<DateTime<Utc>>,
    /// Seconds after creation when the job is deleted.
    #[serde(default)]
    pub lifetime: Option<i64>,
    #[serde(default)]
    pub annotation: String,
}

fn default_priority() -> u8 {
    99
}

impl JobSpec {
    pub fn new(name: &str, user: &str, block_order: BlockOrder) -> Self {
        Self {
            name: name.to_string(),
            user: user.to_string(),
            priority: default_priority(),
            block_order,
            blocks: Vec::new(),
            max_running_tasks: None,
            hosts_mask: String::new(),
            hosts_mask_exclude: String::new(),
            depends: Vec::new(),
            wait_until: None,
            lifetime: None,
            annotation: String::new(),
        }
    }

    pub fn with_block(mut self, block: BlockSpec) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_running(mut self, max: u32) -> Self {
        self.max_running_tasks = Some(max);
        self
    }

    pub fn with_hosts_mask(mut self, include: &str, exclude: &str) -> Self {
        self.hosts_mask = include.to_string();
        self.hosts_mask_exclude = exclude.to_string();
        self
    }

    pub fn with_depend(mut self, job_id: JobId) -> Self {
        self.depends.push(job_id);
        self
    }

    pub fn with_wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.wait_until = Some(at);
        self
    }

    pub fn with_lifetime(mut self, secs: i64) -> Self {
        self.lifetime = Some(secs);
        self
    }
}

/// Aggregate task counters over all blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: usize,
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub skipped: usize,
    pub percent: u8,
}

/// Result of a task report or administrative change on one job.
#[derive(Debug, Default)]
pub struct TaskUpdate {
    /// Executions that stopped belonging to their render.
    pub released: Vec<Released>,
    /// Whether the released execution ended in failure.
    pub failed: bool,
    pub notices: Vec<OutputNotice>,
    pub state_change: Option<(JobState, JobState)>,
    /// Tasks that reached `Done` or `Error`, with their final logs.
    pub finished: Vec<(TaskPos, Vec<String>)>,
    /// The report did not match the task's current execution.
    pub ignored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub user: String,
    pub priority: u8,
    pub block_order: BlockOrder,
    pub hosts: HostMasks,
    pub max_running_tasks: Option<u32>,
    pub lifetime: Option<i64>,
    pub depends: BTreeSet<JobId>,
    pub wait_until: Option<DateTime<Utc>>,
    pub annotation: String,

    pub state: JobState,
    pub paused: bool,
    pub deleting: bool,
    pub skipped: bool,
    pub depend_status: DependStatus,
    /// Dependencies seen complete. They stay satisfied after leaving live state.
    #[serde(default)]
    pub depends_done: BTreeSet<JobId>,

    pub blocks: Vec<Block>,
    pub error_hosts: ErrorHosts,
    pub counters: JobCounters,
    pub log: Vec<String>,
    pub log_max_lines: usize,
    pub error_fraction: f32,

    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_done: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        spec: &JobSpec,
        now: DateTime<Utc>,
        log_max_lines: usize,
        error_fraction: f32,
    ) -> Result<Self> {
        if spec.blocks.is_empty() {
            return Err(SchedulerError::InvalidJob("job has no blocks".into()));
        }
        if spec.user.is_empty() {
            return Err(SchedulerError::InvalidJob("job has no user".into()));
        }
        if spec.depends.contains(&id) {
            return Err(SchedulerError::InvalidJob("job depends on itself".into()));
        }
        let blocks = spec
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| Block::from_spec(i, b))
            .collect::<Result<Vec<_>>>()?;

        let depends: BTreeSet<JobId> = spec.depends.iter().copied().collect();
        let mut job = Self {
            id,
            name: spec.name.clone(),
            user: spec.user.clone(),
            priority: spec.priority,
            block_order: spec.block_order,
            hosts: HostMasks::new(&spec.hosts_mask, &spec.hosts_mask_exclude)?,
            max_running_tasks: spec.max_running_tasks,
            lifetime: spec.lifetime,
            depend_status: if depends.is_empty() {
                DependStatus::Satisfied
            } else {
                DependStatus::Pending
            },
            depends,
            depends_done: BTreeSet::new(),
            wait_until: spec.wait_until,
            annotation: spec.annotation.clone(),
            state: JobState::Ready,
            paused: false,
            deleting: false,
            skipped: false,
            blocks,
            error_hosts: ErrorHosts::default(),
            counters: JobCounters::default(),
            log: Vec::new(),
            log_max_lines,
            error_fraction,
            time_created: now,
            time_started: None,
            time_done: None,
        };
        job.append_log(now, format!("Created by {}", job.user));
        job.refresh_state(now);
        Ok(job)
    }

    pub fn append_log(&mut self, now: DateTime<Utc>, message: String) {
        self.log
            .push(format!("{}: {}", now.format("%Y-%m-%d %H:%M:%S"), message));
        if self.log.len() > self.log_max_lines {
            let excess = self.log.len() - self.log_max_lines;
            self.log.drain(..excess);
        }
    }

    fn log_task(&mut self, block: usize, task: usize, now: DateTime<Utc>, message: String) {
        let max = self.log_max_lines;
        let line = format!("{}: {}", now.format("%Y-%m-%d %H:%M:%S"), message);
        self.blocks[block].tasks[task].append_log(line, max);
    }

    pub fn check_block(&self, block: usize) -> Result<()> {
        if block < self.blocks.len() {
            Ok(())
        } else {
            Err(SchedulerError::InvalidBlock {
                job_id: self.id,
                block,
            })
        }
    }

    pub fn check_task(&self, block: usize, task: usize) -> Result<()> {
        self.check_block(block)?;
        if task < self.blocks[block].tasks.len() {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTask {
                job_id: self.id,
                block,
                task,
            })
        }
    }

    fn pos(&self, block: usize, task: usize) -> TaskPos {
        TaskPos {
            job_id: self.id,
            block,
            task,
        }
    }

    pub fn running(&self) -> usize {
        self.blocks.iter().map(Block::running).sum()
    }

    pub fn below_ceiling(&self) -> bool {
        self.max_running_tasks
            .is_none_or(|max| self.running() < max as usize)
    }

    /// Whether new tasks may become ready: nothing above the task level blocks.
    fn gate_open(&self, now: DateTime<Utc>) -> bool {
        !self.paused
            && !self.deleting
            && self.depend_status == DependStatus::Satisfied
            && self.wait_until.is_none_or(|at| at <= now)
    }

    /// Re-derive task readiness, counters and job state. Returns the state
    /// change, if any.
    pub fn refresh_state(&mut self, now: DateTime<Utc>) -> Option<(JobState, JobState)> {
        let gate_open = self.gate_open(now);
        let mut previous_complete = true;
        for block in &mut self.blocks {
            let eligible = gate_open
                && (self.block_order == BlockOrder::Parallel || previous_complete);
            block.set_eligible(eligible);
            previous_complete = previous_complete && block.is_complete();
        }

        let mut c = JobCounters::default();
        let mut weighted: u64 = 0;
        let mut weight_sum: u64 = 0;
        for block in &mut self.blocks {
            let bc = block.refresh_counters();
            c.total += block.tasks.len();
            c.ready += bc.ready;
            c.running += bc.running;
            c.done += bc.done;
            c.error += bc.error;
            c.skipped += bc.skipped;
            let w = block.work_weight();
            weighted += w * bc.percent as u64;
            weight_sum += w;
        }
        c.percent = (weighted / weight_sum.max(1)) as u8;
        self.counters = c;

        let all_complete = c.done + c.skipped == c.total;
        let error_reached = c.error > 0
            && ((c.error as f32) >= self.error_fraction * c.total as f32
                || (c.ready == 0 && c.running == 0));

        let new_state = if self.deleting {
            JobState::Deleted
        } else if self.paused {
            JobState::Offline
        } else if all_complete && self.skipped {
            JobState::Skipped
        } else if all_complete {
            JobState::Done
        } else if self.depend_status == DependStatus::Failed {
            JobState::Error
        } else if error_reached {
            JobState::Error
        } else if c.running > 0 {
            JobState::Running
        } else if self.depend_status == DependStatus::Pending {
            JobState::DependPending
        } else if !gate_open {
            JobState::Waiting
        } else {
            JobState::Ready
        };

        if new_state == JobState::Running && self.time_started.is_none() {
            self.time_started = Some(now);
        }
        if new_state.is_complete() {
            if self.time_done.is_none() {
                self.time_done = Some(now);
            }
        } else {
            self.time_done = None;
        }

        if new_state == self.state {
            return None;
        }
        let old = self.state;
        self.state = new_state;
        tracing::info!(job_id = self.id, from = %old, to = %new_state, "Job state changed");
        self.append_log(now, format!("State {} -> {}", old, new_state));
        Some((old, new_state))
    }

    /// Find and start a task for `render`.
    ///
    /// Blocks are scanned in index order and tasks by ascending index; the
    /// first ready task not avoiding the render wins.
    pub fn solve(
        &mut self,
        render: &RenderProfile,
        policy: &ErrorPolicy,
        now: DateTime<Utc>,
    ) -> Option<TaskExec> {
        if !self.state.is_dispatchable() || !self.hosts.allows(&render.name) || !self.below_ceiling() {
            return None;
        }

        for forgiven in self.error_hosts.forgive(policy.errors_forgive_time, now) {
            tracing::info!(job_id = self.id, host = %forgiven, "Job forgave host");
        }
        if self
            .error_hosts
            .is_avoided(&render.name, policy.errors_avoid_host)
        {
            return None;
        }

        let mut found = None;
        for (b, block) in self.blocks.iter_mut().enumerate() {
            let runnable = render.can_run(&block.service)
                && block
                    .needs_memory_mb
                    .is_none_or(|need| render.memory_mb.is_some_and(|have| have >= need))
                && block.below_ceiling();
            if runnable {
                if let Some(t) = block.find_ready(&render.name, policy, now) {
                    found = Some((b, t));
                    break;
                }
            }
            if self.block_order == BlockOrder::Sequential && !block.is_complete() {
                break;
            }
        }
        let (b, t) = found?;

        let exec_id = Uuid::new_v4();
        self.blocks[b].tasks[t].start(&render.name, exec_id, now);
        self.log_task(b, t, now, format!("Started on {}", render.name));
        self.refresh_state(now);

        let block = &self.blocks[b];
        let task = &block.tasks[t];
        tracing::info!(
            job_id = self.id,
            block = b,
            task = t,
            render = %render.name,
            exec_id = %exec_id,
            "Task dispatched"
        );
        Some(TaskExec {
            job_id: self.id,
            block: b,
            task: t,
            exec_id,
            render: render.name.clone(),
            job_name: self.name.clone(),
            user: self.user.clone(),
            block_name: block.name.clone(),
            task_name: task.name.clone(),
            service: block.service.clone(),
            command: task.command.clone(),
            frames: task.frames,
            needs_memory_mb: block.needs_memory_mb,
        })
    }

    /// Apply a render's report. Reports for an execution the task no longer
    /// runs are ignored, which makes replayed reports harmless.
    pub fn update_task_state(
        &mut self,
        report: &TaskReport,
        policy: &ErrorPolicy,
        now: DateTime<Utc>,
    ) -> Result<TaskUpdate> {
        let (b, t) = (report.block, report.task);
        self.check_task(b, t)?;
        let pos = self.pos(b, t);
        let mut update = TaskUpdate::default();

        if !self.blocks[b].tasks[t].is_running(report.exec_id) {
            tracing::warn!(
                task = %pos,
                exec_id = %report.exec_id,
                render = %report.render,
                "Stale task report ignored"
            );
            update.ignored = true;
            return Ok(update);
        }

        let task = &mut self.blocks[b].tasks[t];
        if let Some(text) = &report.output {
            for address in &task.listeners {
                update.notices.push(OutputNotice {
                    address: address.clone(),
                    pos,
                    output: Some(text.clone()),
                    state: None,
                });
            }
        }

        match report.status {
            ReportStatus::Running => {
                if let Some(percent) = report.percent {
                    task.progress.percent = percent.min(100);
                }
                if let Some(activity) = &report.activity {
                    task.progress.activity = activity.clone();
                }
                tracing::debug!(task = %pos, percent = task.progress.percent, "Task progress");
            }
            ReportStatus::Done => {
                let listeners = task.take_listeners();
                update.released.extend(task.finish(now));
                self.log_task(b, t, now, format!("Done on {}", report.render));
                tracing::info!(task = %pos, render = %report.render, "Task done");
                update.notices.extend(listeners.into_iter().map(|address| OutputNotice {
                    address,
                    pos,
                    output: None,
                    state: Some(TaskState::Done),
                }));
                update.finished.push((pos, self.blocks[b].tasks[t].log.clone()));
            }
            ReportStatus::Error => {
                let host = report.render.as_str();
                let verdict = apply_failure(
                    policy,
                    host,
                    &mut task.progress.errors_count,
                    &mut task.error_hosts,
                    &mut self.error_hosts,
                    now,
                );
                update.released.extend(task.fail(verdict.terminal, now));
                update.failed = true;
                let errors = task.progress.errors_count;
                let listeners: Vec<String> = if verdict.terminal {
                    task.take_listeners()
                } else {
                    task.listeners.iter().cloned().collect()
                };

                self.log_task(b, t, now, format!("Error #{} on {}", errors, host));
                tracing::warn!(task = %pos, render = %host, errors, terminal = verdict.terminal, "Task error");
                if verdict.task_avoids_host {
                    tracing::info!(task = %pos, host, "Task avoids host");
                    self.log_task(b, t, now, format!("Avoiding host {}", host));
                }
                if verdict.job_avoids_host {
                    tracing::info!(job_id = self.id, host, "Job avoids host");
                    self.append_log(now, format!("Avoiding host {}", host));
                }
                update.notices.extend(listeners.into_iter().map(|address| OutputNotice {
                    address,
                    pos,
                    output: None,
                    state: Some(TaskState::Error),
                }));
                update.finished.push((pos, self.blocks[b].tasks[t].log.clone()));
            }
        }

        update.state_change = self.refresh_state(now);
        Ok(update)
    }

    fn selected(&self, sel: &TasksPos) -> Result<Vec<usize>> {
        self.check_block(sel.block)?;
        if sel.tasks.is_empty() {
            return Ok((0..self.blocks[sel.block].tasks.len()).collect());
        }
        for &t in &sel.tasks {
            self.check_task(sel.block, t)?;
        }
        Ok(sel.tasks.clone())
    }

    /// Skip selected tasks. The whole selection is validated before anything changes.
    pub fn skip_tasks(&mut self, sel: &TasksPos, now: DateTime<Utc>) -> Result<TaskUpdate> {
        let tasks = self.selected(sel)?;
        let mut update = TaskUpdate::default();
        for t in tasks {
            let task = &mut self.blocks[sel.block].tasks[t];
            if let Some(released) = task.skip(now) {
                update.released.push(released);
            }
            self.log_task(sel.block, t, now, "Skipped".to_string());
        }
        tracing::info!(job_id = self.id, block = sel.block, "Tasks skipped");
        update.state_change = self.refresh_state(now);
        Ok(update)
    }

    /// Restart selected tasks, whatever their state.
    pub fn restart_tasks(
        &mut self,
        sel: &TasksPos,
        reset_errors: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskUpdate> {
        let tasks = self.selected(sel)?;
        let mut update = TaskUpdate::default();
        self.skipped = false;
        for t in tasks {
            let task = &mut self.blocks[sel.block].tasks[t];
            if let Some(released) = task.restart(reset_errors) {
                update.released.push(released);
            }
            self.log_task(sel.block, t, now, "Restarted".to_string());
        }
        tracing::info!(job_id = self.id, block = sel.block, reset_errors, "Tasks restarted");
        update.state_change = self.refresh_state(now);
        Ok(update)
    }

    /// Restart every task in `Error`, keeping error counts.
    pub fn restart_error_tasks(&mut self, now: DateTime<Utc>) -> TaskUpdate {
        let mut update = TaskUpdate::default();
        for b in 0..self.blocks.len() {
            for t in 0..self.blocks[b].tasks.len() {
                if self.blocks[b].tasks[t].state() == TaskState::Error {
                    self.blocks[b].tasks[t].restart(false);
                    self.log_task(b, t, now, "Restarted after error".to_string());
                }
            }
        }
        update.state_change = self.refresh_state(now);
        update
    }

    /// Skip every task of the job.
    pub fn skip_job(&mut self, now: DateTime<Utc>) -> TaskUpdate {
        let mut update = TaskUpdate::default();
        for block in &mut self.blocks {
            for task in &mut block.tasks {
                update.released.extend(task.skip(now));
            }
        }
        self.skipped = true;
        self.append_log(now, "Job skipped".to_string());
        update.state_change = self.refresh_state(now);
        update
    }

    pub fn set_paused(&mut self, paused: bool, now: DateTime<Utc>) -> Option<(JobState, JobState)> {
        self.paused = paused;
        self.append_log(now, if paused { "Paused" } else { "Started" }.to_string());
        self.refresh_state(now)
    }

    pub fn mark_deleting(&mut self, now: DateTime<Utc>) -> Option<(JobState, JobState)> {
        self.deleting = true;
        self.append_log(now, "Deleting".to_string());
        self.refresh_state(now)
    }

    pub fn set_hosts_mask(&mut self, include: &str, exclude: &str) -> Result<()> {
        self.hosts = HostMasks::new(include, exclude)?;
        Ok(())
    }

    /// Clear job and task blacklists.
    pub fn reset_error_hosts(&mut self, now: DateTime<Utc>) {
        self.error_hosts.clear();
        for block in &mut self.blocks {
            for task in &mut block.tasks {
                task.error_hosts.clear();
            }
        }
        self.append_log(now, "Error hosts reset".to_string());
    }

    /// Hosts the whole job currently avoids.
    pub fn avoided_hosts(&self, policy: &ErrorPolicy) -> Vec<String> {
        self.error_hosts
            .avoided(policy.errors_avoid_host)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Hosts one task currently avoids.
    pub fn task_avoided_hosts(&self, block: usize, task: usize, policy: &ErrorPolicy) -> Result<Vec<String>> {
        self.check_task(block, task)?;
        Ok(self.blocks[block].tasks[task]
            .error_hosts
            .avoided(policy.errors_task_same_host)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    pub fn listen(&mut self, block: usize, task: usize, address: &str, subscribe: bool) -> Result<()> {
        self.check_task(block, task)?;
        let listeners = &mut self.blocks[block].tasks[task].listeners;
        if subscribe {
            listeners.insert(address.to_string());
        } else {
            listeners.remove(address);
        }
        Ok(())
    }

    pub fn task_log(&self, block: usize, task: usize) -> Result<Vec<String>> {
        self.check_task(block, task)?;
        Ok(self.blocks[block].tasks[task].log.clone())
    }

    /// Whether the job outlived its lifetime; `default_lifetime` comes from the owner.
    pub fn lifetime_expired(&self, now: DateTime<Utc>, default_lifetime: Option<i64>) -> bool {
        match self.lifetime.or(default_lifetime) {
            Some(secs) if secs > 0 => now - self.time_created >= Duration::seconds(secs),
            _ => false,
        }
    }

    /// Weight with the log, blacklist and progress shares broken out.
    pub fn weight(&self) -> JobWeight {
        let mut w = JobWeight {
            logs: weigh_strings(&self.log),
            black_lists: self.error_hosts.calc_weight(),
            ..JobWeight::default()
        };
        for block in &self.blocks {
            for task in &block.tasks {
                w.logs += weigh_strings(&task.log);
                w.black_lists += task.error_hosts.calc_weight();
                w.progress += task.progress.calc_weight();
            }
        }
        w.total = size_of::<Job>()
            + weigh_string(&self.name)
            + weigh_string(&self.user)
            + weigh_string(&self.annotation)
            + self.hosts.calc_weight()
            + self.depends.len() * size_of::<JobId>()
            + weigh_strings(&self.log)
            + self.error_hosts.calc_weight()
            + self.blocks.iter().map(Weigh::calc_weight).sum::<usize>();
        w
    }
}

impl Weigh for Job {
    fn calc_weight(&self) -> usize {
        self.weight().total
    }
}
