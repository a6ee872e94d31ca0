use std::collections::HashMap;
use std::mem::size_of;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::UserDefaults;
use crate::scheduler::host_mask::HostMasks;
use crate::weight::{weigh_string, Weigh};

/// Error handling parameters a user applies to all of their jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Failures after which a task stays in `Error`.
    pub errors_retries: u32,
    /// Failures of one host within a job after which the whole job avoids it.
    /// Zero disables job-wide avoiding.
    pub errors_avoid_host: u32,
    /// Failures of one host on one task after which that task avoids it.
    /// Zero disables per-task avoiding.
    pub errors_task_same_host: u32,
    /// Seconds after the last failure when a host is forgiven. Zero never forgives.
    pub errors_forgive_time: i64,
}

impl ErrorPolicy {
    /// `E-<avoid>j|<same host>t|<retries>r`, followed by ` F<h:m:s>` when forgiving is on.
    pub fn errors_solving(&self) -> String {
        let mut s = format!(
            "E-{}j|{}t|{}r",
            self.errors_avoid_host, self.errors_task_same_host, self.errors_retries
        );
        if self.errors_forgive_time > 0 {
            s.push_str(&format!(" F{}", format_hms(self.errors_forgive_time)));
        }
        s
    }
}

fn format_hms(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m, s) {
        (h, 0, 0) if h > 0 => format!("{}h", h),
        (0, m, 0) if m > 0 => format!("{}m", m),
        (0, 0, s) => format!("{}s", s),
        _ => format!("{}:{:02}:{:02}", h, m, s),
    }
}

impl From<&UserDefaults> for ErrorPolicy {
    fn from(d: &UserDefaults) -> Self {
        Self {
            errors_retries: d.errors_retries,
            errors_avoid_host: d.errors_avoid_host,
            errors_task_same_host: d.errors_task_same_host,
            errors_forgive_time: d.errors_forgive_time,
        }
    }
}

/// Owner of jobs. Counters are derived by the refresh sweep and by dispatch
/// bookkeeping, never edited directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub priority: u8,
    pub max_running_tasks: Option<u32>,
    pub hosts: HostMasks,
    pub policy: ErrorPolicy,
    pub jobs_life_time: Option<i64>,
    pub permanent: bool,
    pub time_register: Option<DateTime<Utc>>,
    pub annotation: String,

    pub jobs_num: u32,
    pub running_jobs_num: u32,
    pub running_tasks_num: u32,
}

impl User {
    pub fn new(id: u32, name: &str, defaults: &UserDefaults) -> Self {
        Self {
            id,
            name: name.to_string(),
            priority: defaults.priority,
            max_running_tasks: defaults.max_running_tasks,
            hosts: HostMasks::default(),
            policy: ErrorPolicy::from(defaults),
            jobs_life_time: defaults.jobs_life_time,
            permanent: false,
            time_register: None,
            annotation: String::new(),
            jobs_num: 0,
            running_jobs_num: 0,
            running_tasks_num: 0,
        }
    }

    pub fn set_permanent(&mut self, value: bool, now: DateTime<Utc>) {
        self.permanent = value;
        self.time_register = if value { Some(now) } else { None };
    }

    pub fn below_ceiling(&self) -> bool {
        self.max_running_tasks
            .is_none_or(|max| self.running_tasks_num < max)
    }
}

impl Weigh for User {
    fn calc_weight(&self) -> usize {
        size_of::<User>()
            + weigh_string(&self.name)
            + weigh_string(&self.annotation)
            + self.hosts.calc_weight()
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max = self
            .max_running_tasks
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "#{}:{} {} j{}/{} r{}/{} {} {}",
            self.id,
            self.priority,
            self.name,
            self.jobs_num,
            self.running_jobs_num,
            self.running_tasks_num,
            max,
            if self.permanent { "P" } else { "T" },
            self.policy.errors_solving()
        )
    }
}

/// Registry of known users, keyed by name.
#[derive(Debug, Default)]
pub struct UserPool {
    users: HashMap<String, User>,
    next_id: u32,
}

impl UserPool {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.get_mut(name)
    }

    /// Returns the user, creating an ephemeral one with `defaults` if unknown.
    pub fn get_or_create(&mut self, name: &str, defaults: &UserDefaults) -> &mut User {
        let next_id = &mut self.next_id;
        self.users.entry(name.to_string()).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            tracing::info!(user = name, user_id = id, "User created");
            User::new(id, name, defaults)
        })
    }

    /// Insert a user loaded from storage, keeping ids unique.
    pub fn insert(&mut self, user: User) {
        self.next_id = self.next_id.max(user.id + 1);
        self.users.insert(user.name.clone(), user);
    }

    pub fn all(&self) -> Vec<&User> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn task_started(&mut self, name: &str) {
        if let Some(user) = self.users.get_mut(name) {
            user.running_tasks_num += 1;
        }
    }

    pub fn task_finished(&mut self, name: &str) {
        if let Some(user) = self.users.get_mut(name) {
            user.running_tasks_num = user.running_tasks_num.saturating_sub(1);
        }
    }

    /// Drop ephemeral users that no longer own jobs. Returns their names.
    pub fn remove_idle_ephemeral(&mut self) -> Vec<String> {
        let idle: Vec<String> = self
            .users
            .values()
            .filter(|u| !u.permanent && u.jobs_num == 0 && u.running_tasks_num == 0)
            .map(|u| u.name.clone())
            .collect();
        for name in &idle {
            self.users.remove(name);
            tracing::info!(user = %name, "Ephemeral user removed");
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_solving_string() {
        let policy = ErrorPolicy {
            errors_retries: 3,
            errors_avoid_host: 3,
            errors_task_same_host: 2,
            errors_forgive_time: 18_000,
        };
        assert_eq!(policy.errors_solving(), "E-3j|2t|3r F5h");

        let never = ErrorPolicy {
            errors_forgive_time: 0,
            ..policy
        };
        assert_eq!(never.errors_solving(), "E-3j|2t|3r");
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(90), "0:01:30");
        assert_eq!(format_hms(600), "10m");
        assert_eq!(format_hms(45), "45s");
    }

    #[test]
    fn get_or_create_assigns_increasing_ids() {
        let mut pool = UserPool::new();
        let defaults = UserDefaults::default();
        let a = pool.get_or_create("alice", &defaults).id;
        let b = pool.get_or_create("bob", &defaults).id;
        let a2 = pool.get_or_create("alice", &defaults).id;
        assert_eq!(a, a2);
        assert!(b > a);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn ceiling_respects_running_tasks() {
        let defaults = UserDefaults {
            max_running_tasks: Some(1),
            ..UserDefaults::default()
        };
        let mut pool = UserPool::new();
        pool.get_or_create("alice", &defaults);
        assert!(pool.get("alice").unwrap().below_ceiling());
        pool.task_started("alice");
        assert!(!pool.get("alice").unwrap().below_ceiling());
        pool.task_finished("alice");
        pool.task_finished("alice");
        assert_eq!(pool.get("alice").unwrap().running_tasks_num, 0);
    }

    #[test]
    fn permanent_users_survive_idle_sweep() {
        let defaults = UserDefaults::default();
        let mut pool = UserPool::new();
        pool.get_or_create("temp", &defaults);
        pool.get_or_create("keeper", &defaults)
            .set_permanent(true, Utc::now());
        let removed = pool.remove_idle_ephemeral();
        assert_eq!(removed, vec!["temp".to_string()]);
        assert!(pool.get("keeper").unwrap().time_register.is_some());
    }
}
