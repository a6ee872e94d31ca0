use std::collections::{BTreeSet, HashMap};
use std::mem::size_of;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::task::TaskPos;
use crate::weight::{weigh_set, weigh_string, Weigh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderState {
    Online,
    Busy,
    Offline,
}

impl std::fmt::Display for RenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderState::Online => write!(f, "online"),
            RenderState::Busy => write!(f, "busy"),
            RenderState::Offline => write!(f, "offline"),
        }
    }
}

/// What a render announces about itself when it registers or offers itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderProfile {
    pub name: String,
    pub address: String,
    pub capabilities: BTreeSet<String>,
    pub memory_mb: Option<u32>,
}

impl RenderProfile {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            capabilities: BTreeSet::new(),
            memory_mb: None,
        }
    }

    pub fn with_capability(mut self, service: &str) -> Self {
        self.capabilities.insert(service.to_string());
        self
    }

    pub fn with_memory(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn can_run(&self, service: &str) -> bool {
        self.capabilities.contains(service)
    }
}

/// The task a render is executing. This is a lookup reference only; the owning
/// job is the authority on task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub pos: TaskPos,
    pub exec_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Render {
    pub profile: RenderProfile,
    pub state: RenderState,
    pub current: Option<Assignment>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub tasks_done: u64,
    pub tasks_failed: u64,
}

impl Render {
    pub fn new(profile: RenderProfile, now: DateTime<Utc>) -> Self {
        Self {
            profile,
            state: RenderState::Online,
            current: None,
            last_heartbeat: now,
            registered_at: now,
            tasks_done: 0,
            tasks_failed: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn is_alive(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        now - self.last_heartbeat < Duration::seconds(timeout_secs)
    }

    /// Online and not executing anything.
    pub fn is_idle(&self) -> bool {
        self.state == RenderState::Online && self.current.is_none()
    }
}

impl Weigh for Render {
    fn calc_weight(&self) -> usize {
        size_of::<Render>()
            + weigh_string(&self.profile.name)
            + weigh_string(&self.profile.address)
            + weigh_set(&self.profile.capabilities)
    }
}

/// Registry of renders keyed by host name.
#[derive(Debug, Default)]
pub struct RenderPool {
    renders: HashMap<String, Render>,
    timeout_secs: i64,
}

impl RenderPool {
    pub fn new(timeout_secs: i64) -> Self {
        Self {
            renders: HashMap::new(),
            timeout_secs,
        }
    }

    /// Register a render, or refresh the profile and heartbeat of a known one.
    /// An offline render comes back online.
    pub fn register(&mut self, profile: RenderProfile, now: DateTime<Utc>) -> &Render {
        let name = profile.name.clone();
        let render = self
            .renders
            .entry(name.clone())
            .and_modify(|r| {
                r.last_heartbeat = now;
                if r.state == RenderState::Offline {
                    tracing::info!(render = %r.profile.name, "Render back online");
                    r.state = if r.current.is_some() {
                        RenderState::Busy
                    } else {
                        RenderState::Online
                    };
                }
            })
            .or_insert_with(|| {
                tracing::info!(render = %name, address = %profile.address, "Render registered");
                Render::new(profile.clone(), now)
            });
        render.profile = profile;
        render
    }

    pub fn heartbeat(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let render = self
            .renders
            .get_mut(name)
            .ok_or_else(|| SchedulerError::RenderNotFound(name.to_string()))?;
        render.last_heartbeat = now;
        if render.state == RenderState::Offline {
            render.state = if render.current.is_some() {
                RenderState::Busy
            } else {
                RenderState::Online
            };
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Render> {
        self.renders.get(name)
    }

    pub fn assign(&mut self, name: &str, assignment: Assignment) {
        if let Some(render) = self.renders.get_mut(name) {
            render.current = Some(assignment);
            render.state = RenderState::Busy;
        }
    }

    /// Clear the back-reference if it still points at `exec_id`.
    pub fn release(&mut self, name: &str, exec_id: Uuid, failed: bool) {
        let Some(render) = self.renders.get_mut(name) else {
            return;
        };
        if render.current.is_some_and(|a| a.exec_id == exec_id) {
            render.current = None;
            if failed {
                render.tasks_failed += 1;
            } else {
                render.tasks_done += 1;
            }
            if render.state == RenderState::Busy {
                render.state = RenderState::Online;
            }
        }
    }

    /// Renders that are alive and have no task.
    pub fn idle_renders(&self, now: DateTime<Utc>) -> Vec<&Render> {
        let mut idle: Vec<&Render> = self
            .renders
            .values()
            .filter(|r| r.is_idle() && r.is_alive(now, self.timeout_secs))
            .collect();
        idle.sort_by(|a, b| a.name().cmp(b.name()));
        idle
    }

    /// Mark renders whose heartbeat window elapsed as offline. Returns each
    /// newly offline render's name and the task it still holds, if any.
    pub fn mark_dead(&mut self, now: DateTime<Utc>) -> Vec<(String, Option<Assignment>)> {
        let timeout = self.timeout_secs;
        let mut dead = Vec::new();
        for render in self.renders.values_mut() {
            if render.state != RenderState::Offline && !render.is_alive(now, timeout) {
                tracing::warn!(
                    render = %render.profile.name,
                    last_heartbeat = %render.last_heartbeat,
                    "Render heartbeat timed out"
                );
                render.state = RenderState::Offline;
                dead.push((render.profile.name.clone(), render.current));
            }
        }
        dead.sort_by(|a, b| a.0.cmp(&b.0));
        dead
    }

    pub fn all(&self) -> Vec<&Render> {
        let mut all: Vec<&Render> = self.renders.values().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn calc_weight(&self) -> usize {
        self.renders.values().map(Weigh::calc_weight).sum()
    }
}
