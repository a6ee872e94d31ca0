use std::collections::BTreeSet;
use std::mem::size_of;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::error_hosts::ErrorHosts;
use crate::scheduler::JobId;
use crate::weight::{weigh_set, weigh_string, weigh_strings, Weigh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not yet eligible: the block or the job is blocked.
    Waiting,
    Ready,
    Running,
    Done,
    Error,
    Skipped,
}

impl TaskState {
    /// Done or skipped: nothing more will happen unless restarted.
    pub fn is_complete(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Skipped)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Done => write!(f, "done"),
            TaskState::Error => write!(f, "error"),
            TaskState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Position of a task: unique within the whole scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskPos {
    pub job_id: JobId,
    pub block: usize,
    pub task: usize,
}

impl std::fmt::Display for TaskPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}][{}]", self.job_id, self.block, self.task)
    }
}

/// Execution progress of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub state: TaskState,
    pub percent: u8,
    pub activity: String,
    /// Render executing the task. Set only while `Running`.
    pub host: Option<String>,
    /// Id of the current execution. Set only while `Running`.
    pub exec_id: Option<Uuid>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_done: Option<DateTime<Utc>>,
    pub errors_count: u32,
    pub starts_count: u32,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            state: TaskState::Waiting,
            percent: 0,
            activity: String::new(),
            host: None,
            exec_id: None,
            time_started: None,
            time_done: None,
            errors_count: 0,
            starts_count: 0,
        }
    }
}

impl Weigh for TaskProgress {
    fn calc_weight(&self) -> usize {
        size_of::<TaskProgress>()
            + weigh_string(&self.activity)
            + self.host.as_ref().map(weigh_string).unwrap_or(0)
    }
}

/// The render and execution a task was released from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub host: String,
    pub exec_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub command: String,
    pub frames: Option<(i64, i64)>,
    pub progress: TaskProgress,
    pub error_hosts: ErrorHosts,
    pub log: Vec<String>,
    /// Addresses subscribed to live output.
    pub listeners: BTreeSet<String>,
}

impl Task {
    pub fn new(name: String, command: String, frames: Option<(i64, i64)>) -> Self {
        Self {
            name,
            command,
            frames,
            progress: TaskProgress::default(),
            error_hosts: ErrorHosts::default(),
            log: Vec::new(),
            listeners: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.progress.state
    }

    /// Completion used for aggregate percentages.
    pub fn percent(&self) -> u8 {
        match self.progress.state {
            TaskState::Done | TaskState::Skipped => 100,
            TaskState::Running => self.progress.percent.min(100),
            _ => 0,
        }
    }

    pub fn append_log(&mut self, line: String, max_lines: usize) {
        self.log.push(line);
        if self.log.len() > max_lines {
            let excess = self.log.len() - max_lines;
            self.log.drain(..excess);
        }
    }

    pub fn make_ready(&mut self) -> bool {
        if self.progress.state == TaskState::Waiting {
            self.progress.state = TaskState::Ready;
            true
        } else {
            false
        }
    }

    pub fn make_waiting(&mut self) -> bool {
        if self.progress.state == TaskState::Ready {
            self.progress.state = TaskState::Waiting;
            true
        } else {
            false
        }
    }

    /// Ready -> Running.
    pub fn start(&mut self, host: &str, exec_id: Uuid, now: DateTime<Utc>) {
        let p = &mut self.progress;
        p.state = TaskState::Running;
        p.host = Some(host.to_string());
        p.exec_id = Some(exec_id);
        p.percent = 0;
        p.activity.clear();
        p.time_started = Some(now);
        p.time_done = None;
        p.starts_count += 1;
    }

    /// Whether `exec_id` is the task's current execution.
    pub fn is_running(&self, exec_id: Uuid) -> bool {
        self.progress.state == TaskState::Running && self.progress.exec_id == Some(exec_id)
    }

    fn release(&mut self) -> Option<Released> {
        let host = self.progress.host.take();
        let exec_id = self.progress.exec_id.take();
        match (host, exec_id) {
            (Some(host), Some(exec_id)) => Some(Released { host, exec_id }),
            _ => None,
        }
    }

    /// Running -> Done.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Option<Released> {
        let released = self.release();
        self.progress.state = TaskState::Done;
        self.progress.percent = 100;
        self.progress.time_done = Some(now);
        released
    }

    /// Running -> Error, then back to Ready unless `terminal`.
    pub fn fail(&mut self, terminal: bool, now: DateTime<Utc>) -> Option<Released> {
        let released = self.release();
        self.progress.time_done = Some(now);
        self.progress.state = if terminal {
            TaskState::Error
        } else {
            TaskState::Ready
        };
        released
    }

    /// Administrative skip. Done and skipped tasks are left as they are.
    pub fn skip(&mut self, now: DateTime<Utc>) -> Option<Released> {
        if self.progress.state.is_complete() {
            return None;
        }
        let released = self.release();
        self.progress.state = TaskState::Skipped;
        self.progress.time_done = Some(now);
        released
    }

    /// Administrative restart from any state.
    pub fn restart(&mut self, reset_errors: bool) -> Option<Released> {
        let released = self.release();
        let p = &mut self.progress;
        p.state = TaskState::Ready;
        p.percent = 0;
        p.activity.clear();
        p.time_started = None;
        p.time_done = None;
        if reset_errors {
            p.errors_count = 0;
            self.error_hosts.clear();
        }
        released
    }

    /// Take the listener list; used when the task reaches a terminal state.
    pub fn take_listeners(&mut self) -> Vec<String> {
        std::mem::take(&mut self.listeners).into_iter().collect()
    }
}

impl Weigh for Task {
    fn calc_weight(&self) -> usize {
        size_of::<Task>() - size_of::<TaskProgress>() - size_of::<ErrorHosts>()
            + weigh_string(&self.name)
            + weigh_string(&self.command)
            + weigh_set(&self.listeners)
            + self.progress.calc_weight()
            + self.error_hosts.calc_weight()
            + weigh_strings(&self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("t".into(), "echo".into(), None)
    }

    #[test]
    fn lifecycle_done() {
        let now = Utc::now();
        let mut t = task();
        assert_eq!(t.state(), TaskState::Waiting);
        assert!(t.make_ready());
        assert!(!t.make_ready());

        let exec = Uuid::new_v4();
        t.start("r1", exec, now);
        assert!(t.is_running(exec));
        assert!(!t.is_running(Uuid::new_v4()));
        assert_eq!(t.progress.starts_count, 1);

        let released = t.finish(now).unwrap();
        assert_eq!(released.host, "r1");
        assert_eq!(released.exec_id, exec);
        assert_eq!(t.state(), TaskState::Done);
        assert!(t.progress.host.is_none());
        assert_eq!(t.percent(), 100);
    }

    #[test]
    fn fail_retries_or_stays_error() {
        let now = Utc::now();
        let mut t = task();
        t.make_ready();
        t.start("r1", Uuid::new_v4(), now);
        t.fail(false, now);
        assert_eq!(t.state(), TaskState::Ready);
        t.start("r1", Uuid::new_v4(), now);
        t.fail(true, now);
        assert_eq!(t.state(), TaskState::Error);
    }

    #[test]
    fn skip_leaves_done_alone() {
        let now = Utc::now();
        let mut t = task();
        t.make_ready();
        t.start("r1", Uuid::new_v4(), now);
        assert!(t.skip(now).is_some());
        assert_eq!(t.state(), TaskState::Skipped);

        let mut done = task();
        done.make_ready();
        done.start("r1", Uuid::new_v4(), now);
        done.finish(now);
        assert!(done.skip(now).is_none());
        assert_eq!(done.state(), TaskState::Done);
    }

    #[test]
    fn restart_optionally_resets_errors() {
        let now = Utc::now();
        let mut t = task();
        t.progress.errors_count = 2;
        t.error_hosts.record("r1", now);
        t.restart(false);
        assert_eq!(t.state(), TaskState::Ready);
        assert_eq!(t.progress.errors_count, 2);
        t.restart(true);
        assert_eq!(t.progress.errors_count, 0);
        assert!(t.error_hosts.is_empty());
    }

    #[test]
    fn log_is_bounded() {
        let mut t = task();
        for i in 0..5 {
            t.append_log(format!("line {}", i), 3);
        }
        assert_eq!(t.log, vec!["line 2", "line 3", "line 4"]);
    }
}
