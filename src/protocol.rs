//! Message contract between the scheduler core and its transport.
//!
//! Every message is a tagged enum variant (`"type"` field) with a fixed field
//! order, so an outer layer can frame and encode them without knowing
//! anything about scheduling. Field order is part of the contract: append new
//! fields at the end.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::render::RenderProfile;
use crate::scheduler::task::{TaskPos, TaskState};
use crate::scheduler::JobId;

/// Outcome carried by a task report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    /// Still running; progress and output only.
    Running,
    Done,
    Error,
}

/// A render's report about the task it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub job_id: JobId,
    pub block: usize,
    pub task: usize,
    pub exec_id: Uuid,
    pub render: String,
    pub status: ReportStatus,
    pub percent: Option<u8>,
    pub activity: Option<String>,
    pub output: Option<String>,
}

impl TaskReport {
    pub fn new(exec: &TaskExec, status: ReportStatus) -> Self {
        Self {
            job_id: exec.job_id,
            block: exec.block,
            task: exec.task,
            exec_id: exec.exec_id,
            render: exec.render.clone(),
            status,
            percent: None,
            activity: None,
            output: None,
        }
    }

    pub fn with_progress(mut self, percent: u8, activity: &str) -> Self {
        self.percent = Some(percent);
        self.activity = Some(activity.to_string());
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn pos(&self) -> TaskPos {
        TaskPos {
            job_id: self.job_id,
            block: self.block,
            task: self.task,
        }
    }
}

/// Tasks of one block addressed by an administrative request. An empty task
/// list means every task of the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksPos {
    pub job_id: JobId,
    pub block: usize,
    pub tasks: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub tasks: TasksPos,
    pub reset_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub job_id: JobId,
    pub block: usize,
    pub task: usize,
    pub address: String,
    /// `false` unsubscribes.
    pub subscribe: bool,
}

/// Inbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    WorkerOffer(RenderProfile),
    Heartbeat { render: String },
    TaskReport(TaskReport),
    AdminSkip(TasksPos),
    AdminRestart(RestartRequest),
    ListenRequest(ListenRequest),
}

/// Everything a render needs to execute a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExec {
    pub job_id: JobId,
    pub block: usize,
    pub task: usize,
    pub exec_id: Uuid,
    pub render: String,
    pub job_name: String,
    pub user: String,
    pub block_name: String,
    pub task_name: String,
    pub service: String,
    pub command: String,
    pub frames: Option<(i64, i64)>,
    pub needs_memory_mb: Option<u32>,
}

impl TaskExec {
    pub fn pos(&self) -> TaskPos {
        TaskPos {
            job_id: self.job_id,
            block: self.block,
            task: self.task,
        }
    }
}

/// Outbound replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Dispatch(TaskExec),
    NoWork,
    Ack,
    /// Renders that should stop the executions they hold.
    Stop { executions: Vec<StopExecution> },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopExecution {
    pub render: String,
    pub exec_id: Uuid,
}

/// Live output or state change for a subscribed listener address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputNotice {
    pub address: String,
    pub pos: TaskPos,
    pub output: Option<String>,
    /// Set when the task entered `Done` or `Error`.
    pub state: Option<TaskState>,
}
