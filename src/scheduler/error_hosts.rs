//! Error policy: retry counting, host blacklisting and forgiveness.
//!
//! Each task and each job keeps an [`ErrorHosts`] list counting failures per
//! host. A task avoids a host once its own count for that host reaches
//! `errors_task_same_host`; a whole job avoids a host once the job-wide count
//! reaches `errors_avoid_host`. Entries expire `errors_forgive_time` seconds
//! after the last failure on that host. Expiry is lazy: it happens when a
//! dispatch evaluates the list, not on a timer.

use std::mem::size_of;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::user::ErrorPolicy;
use crate::weight::{weigh_string, Weigh};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHost {
    pub host: String,
    pub count: u32,
    pub last_error: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHosts {
    entries: Vec<ErrorHost>,
}

impl ErrorHosts {
    /// Count one failure of `host`. Returns the host's new count.
    pub fn record(&mut self, host: &str, now: DateTime<Utc>) -> u32 {
        match self.entries.iter_mut().find(|e| e.host == host) {
            Some(entry) => {
                entry.count += 1;
                entry.last_error = now;
                entry.count
            }
            None => {
                self.entries.push(ErrorHost {
                    host: host.to_string(),
                    count: 1,
                    last_error: now,
                });
                1
            }
        }
    }

    pub fn count(&self, host: &str) -> u32 {
        self.entries
            .iter()
            .find(|e| e.host == host)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Whether `host` reached `threshold` failures. A zero threshold never avoids.
    pub fn is_avoided(&self, host: &str, threshold: u32) -> bool {
        threshold > 0 && self.count(host) >= threshold
    }

    /// Hosts currently at or above `threshold`.
    pub fn avoided(&self, threshold: u32) -> Vec<&str> {
        if threshold == 0 {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.count >= threshold)
            .map(|e| e.host.as_str())
            .collect()
    }

    /// Drop entries whose last failure is at least `forgive_time` seconds old.
    /// A zero `forgive_time` keeps everything. Returns the forgiven hosts.
    pub fn forgive(&mut self, forgive_time: i64, now: DateTime<Utc>) -> Vec<String> {
        if forgive_time <= 0 {
            return Vec::new();
        }
        let window = Duration::seconds(forgive_time);
        let mut forgiven = Vec::new();
        self.entries.retain(|e| {
            if now - e.last_error >= window {
                forgiven.push(e.host.clone());
                false
            } else {
                true
            }
        });
        forgiven
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ErrorHost] {
        &self.entries
    }
}

impl Weigh for ErrorHosts {
    fn calc_weight(&self) -> usize {
        size_of::<ErrorHosts>()
            + self
                .entries
                .iter()
                .map(|e| size_of::<ErrorHost>() + weigh_string(&e.host))
                .sum::<usize>()
    }
}

/// Result of applying the error policy to one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Retries exhausted: the task stays in `Error`.
    pub terminal: bool,
    /// This failure put the host on the task's blacklist.
    pub task_avoids_host: bool,
    /// This failure put the host on the job's blacklist.
    pub job_avoids_host: bool,
}

/// Apply `policy` to a failure of a task on `host`.
///
/// `task_errors` is the task's total error count and is incremented here.
pub fn apply_failure(
    policy: &ErrorPolicy,
    host: &str,
    task_errors: &mut u32,
    task_hosts: &mut ErrorHosts,
    job_hosts: &mut ErrorHosts,
    now: DateTime<Utc>,
) -> FailureVerdict {
    *task_errors += 1;
    let task_count = task_hosts.record(host, now);
    let job_count = job_hosts.record(host, now);

    FailureVerdict {
        terminal: *task_errors >= policy.errors_retries,
        task_avoids_host: policy.errors_task_same_host > 0
            && task_count == policy.errors_task_same_host,
        job_avoids_host: policy.errors_avoid_host > 0 && job_count == policy.errors_avoid_host,
    }
}
