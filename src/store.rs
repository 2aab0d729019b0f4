//! Job record storage: the single source of truth for job state.
//!
//! Every write is conditional on the job's current status. Callers that lose a
//! race get [`StoreError::Conflict`] (or `None` from [`JobStore::claim`]) and
//! must treat the job as owned by someone else.

use crate::models::{Compensation, Job, JobError, JobStatus, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id}: {message}")]
    Invariant { id: Uuid, message: String },
    #[error("job store unavailable: {0}")]
    Backend(String),
}

/// Partial update applied by [`JobStore::update`]. `updated_at` is always written.
#[derive(Debug, Clone, Serialize)]
pub struct JobPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub last_error: Option<Option<JobError>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensations: Option<Vec<Compensation>>,
    pub updated_at: DateTime<Utc>,
    /// Allows `stage` to move backwards. Only rollback sets this.
    #[serde(skip)]
    pub rewind: bool,
}

impl JobPatch {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage: None,
            status: None,
            attempt: None,
            max_attempts: None,
            last_error: None,
            next_run_at: None,
            compensations: None,
            updated_at: now,
            rewind: false,
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn last_error(mut self, error: Option<JobError>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn next_run_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn compensations(mut self, compensations: Vec<Compensation>) -> Self {
        self.compensations = Some(compensations);
        self
    }

    pub fn rewind_to(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self.rewind = true;
        self
    }

    /// Applies the patch to an in-memory job, enforcing record invariants.
    pub fn apply_to(&self, job: &mut Job) -> Result<(), StoreError> {
        if let Some(stage) = self.stage
            && stage < job.stage
            && !self.rewind
        {
            return Err(StoreError::Invariant {
                id: job.id,
                message: format!("stage cannot move back from {} to {stage}", job.stage),
            });
        }
        let attempt = self.attempt.unwrap_or(job.attempt);
        let max_attempts = self.max_attempts.unwrap_or(job.max_attempts);
        if attempt > max_attempts {
            return Err(StoreError::Invariant {
                id: job.id,
                message: format!("attempt {attempt} exceeds max_attempts {max_attempts}"),
            });
        }
        if let Some(stage) = self.stage {
            job.stage = stage;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        job.attempt = attempt;
        job.max_attempts = max_attempts;
        if let Some(error) = &self.last_error {
            job.last_error = error.clone();
        }
        if let Some(at) = self.next_run_at {
            job.next_run_at = at;
        }
        if let Some(compensations) = &self.compensations {
            job.compensations = compensations.clone();
        }
        job.updated_at = self.updated_at;
        Ok(())
    }
}

/// Selects jobs for the recovery scans. All set conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    /// `updated_at` strictly earlier than this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// `next_run_at` at or before this instant.
    pub due_by: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn due_by(mut self, at: DateTime<Utc>) -> Self {
        self.due_by = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.archived_at.is_some() {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(before) = self.updated_before
            && job.updated_at >= before
        {
            return false;
        }
        if let Some(due) = self.due_by {
            match job.next_run_at {
                Some(at) if at <= due => {}
                _ => return false,
            }
        }
        true
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically moves the job to RUNNING if its status is one of `from`.
    /// A RETRY_SCHEDULED job is only claimable once `next_run_at <= now`.
    /// Returns `None` when another worker got there first or the job is not claimable.
    async fn claim(
        &self,
        id: Uuid,
        from: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Applies `patch` only if the job is still in `expected` status.
    async fn update(&self, id: Uuid, patch: JobPatch, expected: JobStatus)
    -> Result<Job, StoreError>;

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    async fn archive(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Process-local store used by tests and demo mode.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Overwrites a job as-is. Test helper for staging clocks and states.
    pub async fn put(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut guard = self.jobs.lock().await;
        if guard.contains_key(&job.id) {
            return Err(StoreError::Invariant {
                id: job.id,
                message: "job already exists".into(),
            });
        }
        guard.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn claim(
        &self,
        id: Uuid,
        from: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut guard = self.jobs.lock().await;
        let Some(job) = guard.get_mut(&id) else {
            return Ok(None);
        };
        if job.archived_at.is_some() || !from.contains(&job.status) || !job.is_due(now) {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected: JobStatus,
    ) -> Result<Job, StoreError> {
        let mut guard = self.jobs.lock().await;
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected || job.archived_at.is_some() {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }
        let mut next = job.clone();
        patch.apply_to(&mut next)?;
        *job = next.clone();
        Ok(next)
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let guard = self.jobs.lock().await;
        let mut jobs: Vec<Job> = guard.values().filter(|job| filter.matches(job)).cloned().collect();
        jobs.sort_by_key(|job| job.updated_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn archive(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !matches!(job.status, JobStatus::Succeeded | JobStatus::DeadLettered) {
            return Err(StoreError::Invariant {
                id,
                message: format!("cannot archive a {} job", job.status),
            });
        }
        job.archived_at = Some(now);
        Ok(())
    }
}
