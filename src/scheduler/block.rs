use std::mem::size_of;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::task::{Task, TaskState};
use crate::scheduler::user::ErrorPolicy;
use crate::weight::{weigh_string, Weigh};

/// `@#@`, `@####@`, ...: frame number, zero padded to the number of `#`.
static FRAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(#+)@").unwrap_or_else(|e| panic!("frame pattern: {}", e)));

/// Replace the first frame pattern with `start` and the following ones with `end`.
pub fn fill_frames(command: &str, start: i64, end: i64) -> String {
    let mut seen = 0;
    FRAME_PATTERN
        .replace_all(command, |caps: &Captures| {
            let width = caps[1].len();
            let frame = if seen == 0 { start } else { end };
            seen += 1;
            format!("{:0width$}", frame, width = width)
        })
        .into_owned()
}

/// Substitute a task argument for `%1` in a block command, or append it.
pub fn fill_argument(command: &str, argument: &str) -> String {
    if argument.is_empty() {
        command.to_string()
    } else if command.contains("%1") {
        command.replace("%1", argument)
    } else {
        format!("{} {}", command, argument)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Argument substituted into the block command.
    pub argument: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockTasks {
    Explicit(Vec<TaskSpec>),
    /// Frame range `first..=last`, `per_task` frames per task.
    Numeric { first: i64, last: i64, per_task: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    /// Service tag a render must offer to run this block.
    pub service: String,
    pub command: String,
    pub tasks: BlockTasks,
    pub max_running_tasks: Option<u32>,
    pub needs_memory_mb: Option<u32>,
    /// Expected seconds per task, used to weight job progress.
    pub task_duration_estimate: Option<u32>,
}

impl BlockSpec {
    pub fn numeric(name: &str, service: &str, command: &str, first: i64, last: i64, per_task: i64) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            command: command.to_string(),
            tasks: BlockTasks::Numeric {
                first,
                last,
                per_task,
            },
            max_running_tasks: None,
            needs_memory_mb: None,
            task_duration_estimate: None,
        }
    }

    pub fn explicit(name: &str, service: &str, command: &str, tasks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            command: command.to_string(),
            tasks: BlockTasks::Explicit(
                tasks
                    .iter()
                    .map(|t| TaskSpec {
                        name: t.to_string(),
                        argument: t.to_string(),
                    })
                    .collect(),
            ),
            max_running_tasks: None,
            needs_memory_mb: None,
            task_duration_estimate: None,
        }
    }

    pub fn with_max_running(mut self, max: u32) -> Self {
        self.max_running_tasks = Some(max);
        self
    }

    pub fn with_memory(mut self, memory_mb: u32) -> Self {
        self.needs_memory_mb = Some(memory_mb);
        self
    }

    pub fn with_duration_estimate(mut self, secs: u32) -> Self {
        self.task_duration_estimate = Some(secs);
        self
    }
}

/// Derived per-block counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounters {
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub skipped: usize,
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    pub name: String,
    pub service: String,
    pub command: String,
    pub max_running_tasks: Option<u32>,
    pub needs_memory_mb: Option<u32>,
    pub task_duration_estimate: Option<u32>,
    pub tasks: Vec<Task>,
    pub counters: BlockCounters,
}

impl Block {
    pub fn from_spec(index: usize, spec: &BlockSpec) -> Result<Self> {
        let invalid = |msg: &str| SchedulerError::InvalidJob(format!("block {}: {}", index, msg));

        let tasks: Vec<Task> = match &spec.tasks {
            BlockTasks::Explicit(specs) => specs
                .iter()
                .map(|t| {
                    Task::new(
                        t.name.clone(),
                        fill_argument(&spec.command, &t.argument),
                        None,
                    )
                })
                .collect(),
            BlockTasks::Numeric {
                first,
                last,
                per_task,
            } => {
                if *per_task < 1 {
                    return Err(invalid("frames per task must be positive"));
                }
                if first > last {
                    return Err(invalid("first frame is after last frame"));
                }
                let mut tasks = Vec::new();
                let mut start = *first;
                while start <= *last {
                    let end = (start + per_task - 1).min(*last);
                    let name = if start == end {
                        format!("frame {}", start)
                    } else {
                        format!("frames {}-{}", start, end)
                    };
                    tasks.push(Task::new(
                        name,
                        fill_frames(&spec.command, start, end),
                        Some((start, end)),
                    ));
                    start = end + 1;
                }
                tasks
            }
        };
        if tasks.is_empty() {
            return Err(invalid("no tasks"));
        }

        Ok(Self {
            index,
            name: spec.name.clone(),
            service: spec.service.clone(),
            command: spec.command.clone(),
            max_running_tasks: spec.max_running_tasks,
            needs_memory_mb: spec.needs_memory_mb,
            task_duration_estimate: spec.task_duration_estimate,
            tasks,
            counters: BlockCounters::default(),
        })
    }

    /// Every task is done or skipped.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.state().is_complete())
    }

    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state() == TaskState::Running)
            .count()
    }

    pub fn below_ceiling(&self) -> bool {
        self.max_running_tasks
            .is_none_or(|max| self.running() < max as usize)
    }

    /// Move tasks between `Waiting` and `Ready` to follow block eligibility.
    /// Returns the number of tasks that changed.
    pub fn set_eligible(&mut self, eligible: bool) -> usize {
        let mut changed = 0;
        for task in &mut self.tasks {
            let moved = if eligible {
                task.make_ready()
            } else {
                task.make_waiting()
            };
            if moved {
                changed += 1;
            }
        }
        changed
    }

    /// First ready task, by ascending index, that does not avoid `host`.
    /// Expired blacklist entries are forgiven on the way.
    pub fn find_ready(&mut self, host: &str, policy: &ErrorPolicy, now: DateTime<Utc>) -> Option<usize> {
        for (index, task) in self.tasks.iter_mut().enumerate() {
            if task.state() != TaskState::Ready {
                continue;
            }
            for forgiven in task.error_hosts.forgive(policy.errors_forgive_time, now) {
                tracing::info!(block = self.index, task = index, host = %forgiven, "Task forgave host");
            }
            if task
                .error_hosts
                .is_avoided(host, policy.errors_task_same_host)
            {
                continue;
            }
            return Some(index);
        }
        None
    }

    /// Recompute counters from task states.
    pub fn refresh_counters(&mut self) -> BlockCounters {
        let mut c = BlockCounters::default();
        let mut percent_sum: usize = 0;
        for task in &self.tasks {
            match task.state() {
                TaskState::Ready => c.ready += 1,
                TaskState::Running => c.running += 1,
                TaskState::Done => c.done += 1,
                TaskState::Error => c.error += 1,
                TaskState::Skipped => c.skipped += 1,
                TaskState::Waiting => {}
            }
            percent_sum += task.percent() as usize;
        }
        c.percent = (percent_sum / self.tasks.len().max(1)) as u8;
        self.counters = c;
        c
    }

    /// Relative amount of work in this block, for progress weighting.
    pub fn work_weight(&self) -> u64 {
        self.tasks.len() as u64 * self.task_duration_estimate.unwrap_or(1).max(1) as u64
    }
}

impl Weigh for Block {
    fn calc_weight(&self) -> usize {
        size_of::<Block>()
            + weigh_string(&self.name)
            + weigh_string(&self.service)
            + weigh_string(&self.command)
            + self.tasks.iter().map(Weigh::calc_weight).sum::<usize>()
    }
}
