use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{DispatchError, Result};

/// A finished regular job as reported by the scheduler database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedJob {
    pub created_on: DateTime<Utc>,
    /// `finished_on` of every host queue entry that has one. Aborted entries
    /// never finish and are absent.
    #[serde(default)]
    pub host_queue_entries: Vec<DateTime<Utc>>,
}

/// Source of truth for whether jobs and special tasks have finished.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// The job, if the scheduler considers it finished.
    async fn finished_job(&self, job_id: u64) -> Result<Option<FinishedJob>>;

    /// Finish times of the job's host queue entries.
    async fn finished_host_queue_entries(&self, job_id: u64) -> Result<Vec<DateTime<Utc>>>;

    /// Finish time of a completed special task.
    async fn completed_special_task(&self, task_id: u64) -> Result<Option<DateTime<Utc>>>;

    /// Reload backing state, once per offload cycle.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Completion state, as held in memory or in a status file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSnapshot {
    #[serde(default)]
    pub jobs: HashMap<u64, FinishedJob>,
    #[serde(default)]
    pub special_tasks: HashMap<u64, DateTime<Utc>>,
}

impl CompletionSnapshot {
    fn finished_job(&self, job_id: u64) -> Option<FinishedJob> {
        self.jobs.get(&job_id).cloned()
    }

    fn finished_host_queue_entries(&self, job_id: u64) -> Vec<DateTime<Utc>> {
        self.jobs
            .get(&job_id)
            .map(|j| j.host_queue_entries.clone())
            .unwrap_or_default()
    }

    fn completed_special_task(&self, task_id: u64) -> Option<DateTime<Utc>> {
        self.special_tasks.get(&task_id).copied()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshot: CompletionSnapshot,
    unavailable: bool,
}

/// Completion service held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryCompletionService {
    state: RwLock<MemoryState>,
}

impl InMemoryCompletionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn finish_job(
        &self,
        job_id: u64,
        created_on: DateTime<Utc>,
        host_queue_entries: Vec<DateTime<Utc>>,
    ) {
        self.state.write().await.snapshot.jobs.insert(
            job_id,
            FinishedJob {
                created_on,
                host_queue_entries,
            },
        );
    }

    pub async fn finish_special_task(&self, task_id: u64, finished: DateTime<Utc>) {
        self.state
            .write()
            .await
            .snapshot
            .special_tasks
            .insert(task_id, finished);
    }

    /// Make every query fail, as when the database cannot be reached.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    async fn snapshot(&self) -> Result<tokio::sync::RwLockReadGuard<'_, MemoryState>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(DispatchError::CompletionService(
                "completion service unavailable".to_string(),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl CompletionService for InMemoryCompletionService {
    async fn finished_job(&self, job_id: u64) -> Result<Option<FinishedJob>> {
        Ok(self.snapshot().await?.snapshot.finished_job(job_id))
    }

    async fn finished_host_queue_entries(&self, job_id: u64) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .snapshot()
            .await?
            .snapshot
            .finished_host_queue_entries(job_id))
    }

    async fn completed_special_task(&self, task_id: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(self.snapshot().await?.snapshot.completed_special_task(task_id))
    }
}

/// Completion service backed by a JSON file that some other process keeps
/// current. The file is re-read on every [`refresh`](CompletionService::refresh).
#[derive(Debug)]
pub struct StatusFileCompletionService {
    path: PathBuf,
    snapshot: RwLock<CompletionSnapshot>,
}

impl StatusFileCompletionService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(CompletionSnapshot::default()),
        }
    }
}

#[async_trait]
impl CompletionService for StatusFileCompletionService {
    async fn finished_job(&self, job_id: u64) -> Result<Option<FinishedJob>> {
        Ok(self.snapshot.read().await.finished_job(job_id))
    }

    async fn finished_host_queue_entries(&self, job_id: u64) -> Result<Vec<DateTime<Utc>>> {
        Ok(self.snapshot.read().await.finished_host_queue_entries(job_id))
    }

    async fn completed_special_task(&self, task_id: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(self.snapshot.read().await.completed_special_task(task_id))
    }

    async fn refresh(&self) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DispatchError::CompletionService(format!("{}: {}", self.path.display(), e))
        })?;
        let snapshot: CompletionSnapshot = serde_json::from_str(&text)?;
        tracing::debug!(
            path = %self.path.display(),
            jobs = snapshot.jobs.len(),
            special_tasks = snapshot.special_tasks.len(),
            "Completion status reloaded"
        );
        *self.snapshot.write().await = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn in_memory_service_reports_finished_jobs() {
        let service = InMemoryCompletionService::new();
        let created = Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap();
        let hqe = Utc.with_ymd_and_hms(2024, 3, 14, 16, 0, 0).unwrap();

        assert!(service.finished_job(118).await.unwrap().is_none());
        service.finish_job(118, created, vec![hqe]).await;

        let job = service.finished_job(118).await.unwrap().unwrap();
        assert_eq!(job.created_on, created);
        assert_eq!(service.finished_host_queue_entries(118).await.unwrap(), vec![hqe]);
    }

    #[tokio::test]
    async fn unavailable_service_fails_queries() {
        let service = InMemoryCompletionService::new();
        service.set_unavailable(true).await;
        assert!(matches!(
            service.completed_special_task(1).await,
            Err(DispatchError::CompletionService(_))
        ));
    }

    #[tokio::test]
    async fn status_file_reloads_on_refresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(
            &path,
            r#"{"jobs": {"118": {"created_on": "2024-03-14T15:09:26Z"}},
                "special_tasks": {"333": "2024-03-14T16:00:00Z"}}"#,
        )
        .unwrap();

        let service = StatusFileCompletionService::new(&path);
        assert!(service.finished_job(118).await.unwrap().is_none());

        service.refresh().await.unwrap();
        assert!(service.finished_job(118).await.unwrap().is_some());
        assert!(service.finished_host_queue_entries(118).await.unwrap().is_empty());
        assert_eq!(
            service.completed_special_task(333).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 3, 14, 16, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn status_file_missing_is_an_error() {
        let service = StatusFileCompletionService::new("/nonexistent/status.json");
        assert!(service.refresh().await.is_err());
    }
}
