//! In-memory `JobStore`, used by orchestrator/worker unit tests and as the
//! default for local/dev runs without a durable backend.

use crate::error::{JobsError, Result};
use crate::model::{Job, JobFilter, Page, ProgressEvent};
use crate::store::{JobStore, Transition};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;
const MAX_CAS_ATTEMPTS: u32 = 8;

struct Entry {
    job: Job,
    sender: broadcast::Sender<ProgressEvent>,
}

/// `DashMap`-backed store (the same lock-free-map idiom used elsewhere in
/// this workspace for hot in-process indices).
pub struct InMemoryJobStore {
    jobs: Arc<DashMap<Uuid, Entry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(JobsError::Conflict(job.id.to_string()));
        }
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.jobs.insert(job.id, Entry { job, sender });
        Ok(())
    }

    async fn update(&self, job_id: Uuid, transition: Transition) -> Result<Job> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut candidate = {
                let entry = self
                    .jobs
                    .get(&job_id)
                    .ok_or_else(|| JobsError::NotFound(job_id.to_string()))?;
                entry.job.clone()
            };
            let expected_version = candidate.version;
            transition(&mut candidate)?;
            candidate.version = expected_version + 1;
            candidate.updated_at = chrono::Utc::now();

            let mut entry = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| JobsError::NotFound(job_id.to_string()))?;
            if entry.job.version != expected_version {
                continue; // lost the race, retry against fresh state
            }
            entry.job = candidate.clone();
            return Ok(candidate);
        }
        Err(JobsError::UpdateConflictExhausted {
            job_id: job_id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.jobs
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or_else(|| JobsError::NotFound(job_id.to_string()))
    }

    async fn list(&self, filter: JobFilter, page: Page) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .map(|e| e.job.clone())
            .filter(|j| {
                filter
                    .repository_path
                    .as_ref()
                    .map(|p| &j.repository_path == p)
                    .unwrap_or(true)
                    && filter
                        .state
                        .map(|s| j.aggregate_state() == s)
                        .unwrap_or(true)
            })
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn publish(&self, job_id: Uuid, event: ProgressEvent) -> Result<()> {
        if let Some(entry) = self.jobs.get(&job_id) {
            // `send` errors only when there are no subscribers; best-effort
            // per spec §4.3, so a missing audience is not a failure.
            let _ = entry.sender.send(event);
            Ok(())
        } else {
            Err(JobsError::NotFound(job_id.to_string()))
        }
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<broadcast::Receiver<ProgressEvent>> {
        self.jobs
            .get(&job_id)
            .map(|e| e.sender.subscribe())
            .ok_or_else(|| JobsError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepDescriptor;

    fn steps() -> Vec<StepDescriptor> {
        vec![StepDescriptor {
            name: "filesystem".into(),
            concurrency: 1,
            retries: 1,
            backoff_seconds: 1,
            options: serde_json::json!({}),
        }]
    }

    #[tokio::test]
    async fn test_create_then_get_roundtrip() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        let job = Job::new(id, "/repo", serde_json::json!({}), &steps());
        store.create(job).await.unwrap();
        let loaded = store.get(id).await.unwrap();
        assert_eq!(loaded.id, id);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(Job::new(id, "/repo", serde_json::json!({}), &steps())).await.unwrap();
        let result = store.create(Job::new(id, "/repo", serde_json::json!({}), &steps())).await;
        assert!(matches!(result, Err(JobsError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_increments_version() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(Job::new(id, "/repo", serde_json::json!({}), &steps())).await.unwrap();
        let updated = store
            .update(id, Box::new(|j| { j.cancellation_requested = true; Ok(()) }))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert!(updated.cancellation_requested);
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let result = store.update(Uuid::new_v4(), Box::new(|_| Ok(()))).await;
        assert!(matches!(result, Err(JobsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_ok() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(Job::new(id, "/repo", serde_json::json!({}), &steps())).await.unwrap();
        let event = ProgressEvent {
            step: "filesystem".into(),
            percent: 10,
            message: "walking".into(),
            timestamp: chrono::Utc::now(),
        };
        store.publish(id, event).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_event() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(Job::new(id, "/repo", serde_json::json!({}), &steps())).await.unwrap();
        let mut rx = store.subscribe(id).await.unwrap();
        store
            .publish(
                id,
                ProgressEvent {
                    step: "filesystem".into(),
                    percent: 50,
                    message: "halfway".into(),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.percent, 50);
    }

    #[tokio::test]
    async fn test_list_filters_by_repository_path() {
        let store = InMemoryJobStore::new();
        store.create(Job::new(Uuid::new_v4(), "/repo-a", serde_json::json!({}), &steps())).await.unwrap();
        store.create(Job::new(Uuid::new_v4(), "/repo-b", serde_json::json!({}), &steps())).await.unwrap();
        let filtered = store
            .list(
                JobFilter {
                    repository_path: Some("/repo-a".to_string()),
                    state: None,
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].repository_path, "/repo-a");
    }
}
