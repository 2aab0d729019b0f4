//! Periodic sweep over the job store: reclaims orphaned claims, re-enqueues
//! due retries and stranded jobs, re-evaluates paused jobs and archives old
//! terminal ones. Also hosts the operator paths (rollback and bulk retry).

use crate::backoff::backoff;
use crate::config::{RecoverySettings, StagePolicies};
use crate::models::{Compensation, ErrorClass, Job, JobError, JobStatus, Stage};
use crate::queue::{QueueError, QueueTransport};
use crate::remote::StageCalls;
use crate::store::{JobFilter, JobPatch, JobStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("job {id} is at stage {stage}; only published jobs can be rolled back")]
    NotRollbackable { id: Uuid, stage: Stage },
    #[error("job {0} is running; retry the rollback once it settles")]
    Busy(Uuid),
    #[error("compensation for job {id} failed: {message}")]
    Compensation { id: Uuid, message: String },
    #[error("operator confirmation rejected: {0}")]
    Unconfirmed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Orphaned claims given another attempt.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Due retries and stranded PENDING jobs put back on the queue.
    pub reenqueued: usize,
    /// PAUSED jobs sent back through the gates.
    pub resumed: usize,
    pub archived: usize,
    /// Jobs that changed underneath the sweep.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    pub rolled_back: usize,
    pub failed: usize,
}

/// Explicit acknowledgement required for bulk retries. `job_count` must match
/// the number of ids submitted, so a stale or mistyped batch is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfirmation {
    pub operator: String,
    pub job_count: usize,
}

impl OperatorConfirmation {
    pub fn new(operator: impl Into<String>, job_count: usize) -> Self {
        Self {
            operator: operator.into(),
            job_count,
        }
    }

    fn verify(&self, ids: &[Uuid]) -> Result<(), RecoveryError> {
        if self.operator.trim().is_empty() {
            return Err(RecoveryError::Unconfirmed("operator name is empty".into()));
        }
        if self.job_count != ids.len() {
            return Err(RecoveryError::Unconfirmed(format!(
                "confirmed {} jobs but {} were submitted",
                self.job_count,
                ids.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RecoveryController {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueTransport>,
    calls: StageCalls,
    policies: Arc<StagePolicies>,
    settings: RecoverySettings,
}

impl RecoveryController {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueTransport>,
        calls: StageCalls,
        policies: Arc<StagePolicies>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            store,
            queue,
            calls,
            policies,
            settings,
        }
    }

    /// One sweep. A failing job is logged and counted; only a failing query
    /// aborts the sweep.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();
        let limit = self.settings.batch_limit;
        let stale_before = ago(now, self.settings.liveness_timeout());

        let orphans = self
            .store
            .query(&JobFilter::status(JobStatus::Running).updated_before(stale_before).limit(limit))
            .await?;
        for job in orphans {
            match self.reclaim_orphan(&job, now).await {
                Ok(JobStatus::DeadLettered) => report.dead_lettered += 1,
                Ok(_) => report.retried += 1,
                Err(err) => note_failure(&mut report, &job, "reclaim", &err),
            }
        }

        let due = self
            .store
            .query(&JobFilter::status(JobStatus::RetryScheduled).due_by(now).limit(limit))
            .await?;
        for job in due {
            match self.requeue(&job, JobStatus::RetryScheduled, now).await {
                Ok(()) => report.reenqueued += 1,
                Err(err) => note_failure(&mut report, &job, "requeue_due", &err),
            }
        }

        let stranded = self
            .store
            .query(&JobFilter::status(JobStatus::Pending).updated_before(stale_before).limit(limit))
            .await?;
        for job in stranded {
            match self.requeue(&job, JobStatus::Pending, now).await {
                Ok(()) => report.reenqueued += 1,
                Err(err) => note_failure(&mut report, &job, "requeue_stranded", &err),
            }
        }

        let paused = self
            .store
            .query(
                &JobFilter::status(JobStatus::Paused)
                    .updated_before(ago(now, self.settings.paused_recheck()))
                    .limit(limit),
            )
            .await?;
        for job in paused {
            match self.requeue(&job, JobStatus::Paused, now).await {
                Ok(()) => report.resumed += 1,
                Err(err) => note_failure(&mut report, &job, "resume_paused", &err),
            }
        }

        let expired = self
            .store
            .query(
                &JobFilter::statuses(&[JobStatus::Succeeded, JobStatus::DeadLettered])
                    .updated_before(ago(now, self.settings.retention()))
                    .limit(limit),
            )
            .await?;
        for job in expired {
            match self.store.archive(job.id, now).await {
                Ok(()) => report.archived += 1,
                Err(err) => note_failure(&mut report, &job, "archive", &err.into()),
            }
        }

        crate::metrics::recovery_counts(
            report.retried,
            report.dead_lettered,
            report.reenqueued + report.resumed,
            report.archived,
        );
        if report != RecoveryReport::default() {
            info!(
                target = "relist.recovery",
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                reenqueued = report.reenqueued,
                resumed = report.resumed,
                archived = report.archived,
                skipped = report.skipped,
                errors = report.errors,
                "recovery_sweep"
            );
        }
        Ok(report)
    }

    /// A claim older than the liveness timeout means the worker died. The
    /// crash costs one attempt.
    async fn reclaim_orphan(&self, job: &Job, now: DateTime<Utc>) -> Result<JobStatus, RecoveryError> {
        let attempt = job.attempt + 1;
        let error = JobError::new(
            ErrorClass::Orphaned,
            job.stage,
            format!("claim expired after {}s", self.settings.liveness_timeout_secs),
            now,
        );
        let patch = JobPatch::new(now).last_error(Some(error));
        if attempt >= job.max_attempts {
            let patch = patch
                .status(JobStatus::DeadLettered)
                .attempt(job.max_attempts)
                .next_run_at(None);
            self.store.update(job.id, patch, JobStatus::Running).await?;
            warn!(
                target = "relist.recovery",
                job_id = %job.id,
                stage = %job.stage,
                attempt,
                "orphan_dead_lettered"
            );
            return Ok(JobStatus::DeadLettered);
        }
        let delay = backoff(self.policies.for_stage(job.stage), attempt);
        let run_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        let patch = patch
            .status(JobStatus::RetryScheduled)
            .attempt(attempt)
            .next_run_at(Some(run_at));
        self.store.update(job.id, patch, JobStatus::Running).await?;
        self.queue.enqueue(job.id, Some(run_at)).await?;
        info!(
            target = "relist.recovery",
            job_id = %job.id,
            stage = %job.stage,
            attempt,
            next_run_at = %run_at,
            "orphan_rescheduled"
        );
        Ok(JobStatus::RetryScheduled)
    }

    /// Moves the job to PENDING (from `expected`) and puts it on the queue.
    async fn requeue(&self, job: &Job, expected: JobStatus, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        let patch = JobPatch::new(now).status(JobStatus::Pending).next_run_at(None);
        self.store.update(job.id, patch, expected).await?;
        self.queue.enqueue(job.id, None).await?;
        debug!(
            target = "relist.recovery",
            job_id = %job.id,
            from = %expected,
            "job_requeued"
        );
        Ok(())
    }

    /// Undoes a publish: runs the publish compensation, rewinds the job to the
    /// checkpoint before publish and re-enqueues it. When the compensation
    /// itself fails the job is marked FAILED for manual attention.
    pub async fn rollback(&self, job_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Job, RecoveryError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        if job.stage < Stage::Publish {
            return Err(RecoveryError::NotRollbackable {
                id: job.id,
                stage: job.stage,
            });
        }
        if job.status == JobStatus::Running {
            return Err(RecoveryError::Busy(job.id));
        }

        if let Err(err) = self.calls.publish.compensate(&job.target_id).await {
            let message = err.to_string();
            let patch = JobPatch::new(now).status(JobStatus::Failed).last_error(Some(JobError::new(
                ErrorClass::Compensation,
                Stage::Publish,
                message.clone(),
                now,
            )));
            self.store.update(job.id, patch, job.status).await?;
            error!(
                target = "relist.recovery",
                job_id = %job.id,
                target_id = %job.target_id,
                error = %message,
                "rollback_compensation_failed"
            );
            return Err(RecoveryError::Compensation { id: job.id, message });
        }

        let mut compensations = job.compensations.clone();
        compensations.push(Compensation {
            stage: Stage::Publish,
            action: "unpublish".into(),
            reason: reason.to_string(),
            at: now,
        });
        let checkpoint = Stage::CHECKPOINT_BEFORE_PUBLISH;
        let patch = JobPatch::new(now)
            .rewind_to(checkpoint)
            .status(JobStatus::Pending)
            .attempt(0)
            .max_attempts(self.policies.for_stage(checkpoint).max_attempts)
            .last_error(None)
            .next_run_at(None)
            .compensations(compensations);
        let updated = self.store.update(job.id, patch, job.status).await?;
        self.queue.enqueue(updated.id, None).await?;
        info!(
            target = "relist.recovery",
            job_id = %updated.id,
            target_id = %updated.target_id,
            reason,
            "job_rolled_back"
        );
        Ok(updated)
    }

    /// Rolls back every job that got past publish. Used after a halt.
    pub async fn rollback_all_published(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RollbackSummary, RecoveryError> {
        let published = self
            .store
            .query(&JobFilter::status(JobStatus::Succeeded))
            .await?;
        let mut summary = RollbackSummary::default();
        for job in published.into_iter().filter(|job| job.stage >= Stage::Publish) {
            match self.rollback(job.id, reason, now).await {
                Ok(_) => summary.rolled_back += 1,
                Err(err) => {
                    error!(
                        target = "relist.recovery",
                        job_id = %job.id,
                        error = %err,
                        "rollback_failed"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Operator-initiated retry of dead-lettered jobs. Ids that are not
    /// DEAD_LETTERED are skipped. Returns how many jobs were re-enqueued.
    pub async fn retry_failed_batch(
        &self,
        ids: &[Uuid],
        confirmation: &OperatorConfirmation,
        now: DateTime<Utc>,
    ) -> Result<usize, RecoveryError> {
        confirmation.verify(ids)?;
        let mut retried = 0;
        for id in ids {
            let patch = JobPatch::new(now)
                .status(JobStatus::Pending)
                .attempt(0)
                .last_error(None)
                .next_run_at(None);
            let outcome = match self.store.update(*id, patch, JobStatus::DeadLettered).await {
                Ok(job) => self.queue.enqueue(job.id, None).await.map_err(RecoveryError::from),
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(()) => retried += 1,
                Err(err) => warn!(
                    target = "relist.recovery",
                    job_id = %id,
                    error = %err,
                    "bulk_retry_skipped"
                ),
            }
        }
        info!(
            target = "relist.recovery",
            operator = %confirmation.operator,
            requested = ids.len(),
            retried,
            "bulk_retry"
        );
        Ok(retried)
    }

    /// Runs [`Self::scan_once`] every `interval` until `shutdown` flips.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.settings.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = controller.scan_once(Utc::now()).await {
                    error!(target = "relist.recovery", error = %err, "recovery_sweep_failed");
                }
            }
            info!(target = "relist.recovery", "recovery_stopped");
        })
    }
}

fn ago(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn note_failure(report: &mut RecoveryReport, job: &Job, step: &'static str, err: &RecoveryError) {
    if matches!(err, RecoveryError::Store(StoreError::Conflict { .. })) {
        debug!(target = "relist.recovery", job_id = %job.id, step, "job_changed_during_sweep");
        report.skipped += 1;
        return;
    }
    error!(
        target = "relist.recovery",
        job_id = %job.id,
        step,
        error = %err,
        "recovery_job_failed"
    );
    report.errors += 1;
}
