//! Persistence boundary.
//!
//! The scheduler reads and writes whole records through [`Store`]; it knows
//! nothing about tables or transactions, only that each save is atomic per
//! record. [`MemoryStore`] keeps serialized records in memory and backs tests
//! and the standalone binary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::scheduler::task::TaskPos;
use crate::scheduler::user::User;
use crate::scheduler::JobId;

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn save_job(&self, job: &Job) -> Result<()>;
    /// Deletes the job record and its task logs.
    async fn delete_job(&self, id: JobId) -> Result<()>;
    async fn job_ids(&self) -> Result<Vec<JobId>>;

    async fn load_user(&self, name: &str) -> Result<Option<User>>;
    async fn save_user(&self, user: &User) -> Result<()>;
    async fn delete_user(&self, name: &str) -> Result<()>;
    async fn user_names(&self) -> Result<Vec<String>>;

    async fn load_task_log(&self, pos: TaskPos) -> Result<Option<Vec<String>>>;
    async fn save_task_log(&self, pos: TaskPos, log: &[String]) -> Result<()>;
}

fn job_key(id: JobId) -> String {
    format!("job/{:010}", id)
}

fn user_key(name: &str) -> String {
    format!("user/{}", name)
}

fn task_log_key(pos: TaskPos) -> String {
    format!("tasklog/{:010}/{}/{}", pos.job_id, pos.block, pos.task)
}

/// Records serialized as JSON values, keyed by record kind and id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn put<T: Serialize + ?Sized>(&self, key: String, record: &T) -> Result<()> {
        let value = serde_json::to_value(record).map_err(|e| SchedulerError::Store(e.to_string()))?;
        self.records.write().await.insert(key, value);
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let records = self.records.read().await;
        records
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).map_err(|e| SchedulerError::Store(e.to_string())))
            .transpose()
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.records
            .read()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        self.get(&job_key(id)).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.put(job_key(job.id), job).await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        let log_prefix = format!("tasklog/{:010}/", id);
        let mut records = self.records.write().await;
        records.remove(&job_key(id));
        records.retain(|k, _| !k.starts_with(&log_prefix));
        Ok(())
    }

    async fn job_ids(&self) -> Result<Vec<JobId>> {
        self.keys_with_prefix("job/")
            .await
            .iter()
            .map(|k| {
                k.parse::<JobId>()
                    .map_err(|e| SchedulerError::Store(format!("bad job key {}: {}", k, e)))
            })
            .collect()
    }

    async fn load_user(&self, name: &str) -> Result<Option<User>> {
        self.get(&user_key(name)).await
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.put(user_key(&user.name), user).await
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        self.records.write().await.remove(&user_key(name));
        Ok(())
    }

    async fn user_names(&self) -> Result<Vec<String>> {
        Ok(self.keys_with_prefix("user/").await)
    }

    async fn load_task_log(&self, pos: TaskPos) -> Result<Option<Vec<String>>> {
        self.get(&task_log_key(pos)).await
    }

    async fn save_task_log(&self, pos: TaskPos, log: &[String]) -> Result<()> {
        self.put(task_log_key(pos), log).await
    }
}
