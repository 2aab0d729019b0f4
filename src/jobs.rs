//! Worker pool: receive a job id, claim it, run its current stage, record the
//! outcome and hand the job to the queue again when more work remains.

use crate::config::WorkerSettings;
use crate::models::{ErrorClass, Job, JobError, JobKind, JobStatus};
use crate::pipeline::{Outcome, StageExecutor};
use crate::queue::{QueueError, QueueTransport};
use crate::store::{JobPatch, JobStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The stage ran and the job now has this status.
    Applied(JobStatus),
    /// Someone else owns the job, or it is no longer claimable.
    Duplicate,
    /// A retry delivered before its backoff elapsed; requeued for `next_run_at`.
    NotDue,
    /// The stage ran but the job changed underneath us (e.g. reclaimed by recovery).
    Superseded,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueTransport>,
    executor: StageExecutor,
    settings: WorkerSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueTransport>,
        executor: StageExecutor,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            settings,
        }
    }

    /// Creates a PENDING job at the kind's entry stage and enqueues it.
    /// If the enqueue fails the job stays PENDING and recovery picks it up later.
    pub async fn submit(&self, kind: JobKind, target_id: &str) -> Result<Job, DispatchError> {
        let max_attempts = self
            .executor
            .policies()
            .for_stage(kind.entry_stage())
            .max_attempts;
        let job = self
            .store
            .create(Job::new(kind, target_id, max_attempts, Utc::now()))
            .await?;
        self.queue.enqueue(job.id, None).await?;
        info!(
            target = "relist.jobs",
            job_id = %job.id,
            kind = ?job.kind,
            target_id = %job.target_id,
            stage = %job.stage,
            "job_submitted"
        );
        Ok(job)
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    /// Handles one delivery. Store backend failures are returned without
    /// acking so the queue redelivers after the visibility timeout.
    pub async fn process(&self, job_id: Uuid) -> Result<Delivery, DispatchError> {
        let claimed_at = Utc::now();
        let Some(job) = self
            .store
            .claim(job_id, &JobStatus::CLAIMABLE, claimed_at)
            .await?
        else {
            if let Some(current) = self.store.get(job_id).await?
                && current.archived_at.is_none()
                && !current.is_due(claimed_at)
            {
                debug!(
                    target = "relist.jobs",
                    job_id = %job_id,
                    next_run_at = ?current.next_run_at,
                    "early_delivery"
                );
                self.queue.ack(job_id).await?;
                self.queue.enqueue(job_id, current.next_run_at).await?;
                return Ok(Delivery::NotDue);
            }
            debug!(target = "relist.jobs", job_id = %job_id, "duplicate_delivery");
            crate::metrics::duplicate_delivery();
            self.queue.ack(job_id).await?;
            return Ok(Delivery::Duplicate);
        };

        let outcome = self.executor.execute(&job).await;
        crate::metrics::job_outcome(job.stage, outcome.label());

        let now = Utc::now();
        let (patch, follow_up) = self.plan(&job, &outcome, now);
        let updated = match self.store.update(job.id, patch, JobStatus::Running).await {
            Ok(updated) => updated,
            Err(err @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                warn!(
                    target = "relist.jobs",
                    job_id = %job.id,
                    stage = %job.stage,
                    error = %err,
                    "outcome_discarded"
                );
                self.queue.ack(job.id).await?;
                return Ok(Delivery::Superseded);
            }
            Err(err) => return Err(err.into()),
        };

        // Ack first: a crash before the enqueue leaves a PENDING job that the
        // stranded-job sweep re-enqueues.
        self.queue.ack(job.id).await?;
        if let Some(not_before) = follow_up {
            self.queue.enqueue(job.id, not_before).await?;
        }

        info!(
            target = "relist.jobs",
            job_id = %updated.id,
            stage = %updated.stage,
            status = %updated.status,
            attempt = updated.attempt,
            outcome = outcome.label(),
            "job_progressed"
        );
        Ok(Delivery::Applied(updated.status))
    }

    /// Store patch for `outcome`, plus `Some(not_before)` when the job must be enqueued again.
    fn plan(
        &self,
        job: &Job,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> (JobPatch, Option<Option<DateTime<Utc>>>) {
        let patch = JobPatch::new(now);
        match outcome {
            Outcome::Advanced(next) if next.is_terminal() => (
                patch
                    .stage(*next)
                    .status(JobStatus::Succeeded)
                    .last_error(None)
                    .next_run_at(None),
                None,
            ),
            Outcome::Advanced(next) => (
                patch
                    .stage(*next)
                    .status(JobStatus::Pending)
                    .attempt(0)
                    .max_attempts(self.executor.policies().for_stage(*next).max_attempts)
                    .last_error(None)
                    .next_run_at(None),
                Some(None),
            ),
            Outcome::RetryLater { delay, reason } => {
                let attempt = job.attempt + 1;
                let error = JobError::new(ErrorClass::Transient, job.stage, reason.clone(), now);
                if attempt >= job.max_attempts {
                    return (
                        patch
                            .status(JobStatus::DeadLettered)
                            .attempt(job.max_attempts)
                            .last_error(Some(error))
                            .next_run_at(None),
                        None,
                    );
                }
                let run_at = now
                    + chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                (
                    patch
                        .status(JobStatus::RetryScheduled)
                        .attempt(attempt)
                        .last_error(Some(error))
                        .next_run_at(Some(run_at)),
                    Some(Some(run_at)),
                )
            }
            Outcome::Fatal(message) => (
                patch
                    .status(JobStatus::DeadLettered)
                    .attempt((job.attempt + 1).min(job.max_attempts))
                    .last_error(Some(JobError::new(
                        ErrorClass::Permanent,
                        job.stage,
                        message.clone(),
                        now,
                    )))
                    .next_run_at(None),
                None,
            ),
            Outcome::Paused(reason) => (
                patch
                    .status(JobStatus::Paused)
                    .last_error(Some(JobError::new(ErrorClass::Veto, job.stage, reason.clone(), now)))
                    .next_run_at(None),
                None,
            ),
        }
    }

    /// Starts `count` workers. They stop taking new deliveries once `shutdown`
    /// flips to true; a stage already running is allowed to finish.
    pub fn spawn(&self, count: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|index| {
                let dispatcher = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run_worker(index, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self, index: usize, mut shutdown: watch::Receiver<bool>) {
        info!(target = "relist.jobs", worker = index, "worker_started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive(self.settings.receive_wait()) => received,
            };
            match received {
                Ok(Some(job_id)) => {
                    if let Err(err) = self.process(job_id).await {
                        error!(
                            target = "relist.jobs",
                            worker = index,
                            job_id = %job_id,
                            error = %err,
                            "delivery_failed"
                        );
                        tokio::time::sleep(self.settings.transport_backoff()).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target = "relist.jobs", worker = index, error = %err, "receive_failed");
                    tokio::time::sleep(self.settings.transport_backoff()).await;
                }
            }
        }
        info!(target = "relist.jobs", worker = index, "worker_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use crate::pipeline::tests::{Harness, ScriptedStage};
    use crate::queue::MemoryQueue;
    use crate::remote::StageError;
    use crate::store::MemoryJobStore;
    use std::time::Duration;

    struct Fixture {
        harness: Harness,
        store: MemoryJobStore,
        queue: MemoryQueue,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                harness: Harness::new(),
                store: MemoryJobStore::new(),
                queue: MemoryQueue::new(Duration::from_secs(30)),
            }
        }

        fn dispatcher(&self, executor: StageExecutor) -> Dispatcher {
            Dispatcher::new(
                Arc::new(self.store.clone()),
                Arc::new(self.queue.clone()),
                executor,
                WorkerSettings {
                    count: 2,
                    receive_wait_ms: 50,
                    transport_backoff_ms: 10,
                },
            )
        }

        async fn wait_for_retry(&self, job: &Job) {
            if let Some(at) = job.next_run_at
                && let Ok(wait) = (at - Utc::now()).to_std()
            {
                tokio::time::sleep(wait + Duration::from_millis(1)).await;
            }
        }
    }

    #[tokio::test]
    async fn exhausted_transient_failures_dead_letter() {
        let fixture = Fixture::new();
        let enrich = Arc::new(ScriptedStage::new(vec![Err(StageError::transient("HTTP 503"))]));
        let executor = fixture
            .harness
            .executor_with(fixture.harness.calls_with(Stage::Enrich, enrich.clone()));
        let dispatcher = fixture.dispatcher(executor);
        let job = dispatcher.submit(JobKind::Enrich, "p1").await.unwrap();
        assert_eq!(job.max_attempts, 3);

        let mut run_times = Vec::new();
        for _ in 0..2 {
            assert_eq!(
                dispatcher.process(job.id).await.unwrap(),
                Delivery::Applied(JobStatus::RetryScheduled)
            );
            let current = dispatcher.status(job.id).await.unwrap().unwrap();
            run_times.push(current.next_run_at.unwrap());
            fixture.wait_for_retry(&current).await;
        }
        assert!(run_times[1] > run_times[0]);

        assert_eq!(
            dispatcher.process(job.id).await.unwrap(),
            Delivery::Applied(JobStatus::DeadLettered)
        );
        let job = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(job.stage, Stage::Enrich);
        let error = job.last_error.expect("last error recorded");
        assert_eq!(error.class, ErrorClass::Transient);
        assert_eq!(enrich.call_count(), 3);

        // dead letters are not claimable
        assert_eq!(dispatcher.process(job.id).await.unwrap(), Delivery::Duplicate);
        assert_eq!(enrich.call_count(), 3);
    }

    #[tokio::test]
    async fn early_retry_delivery_waits_for_backoff() {
        let fixture = Fixture::new();
        let enrich = Arc::new(ScriptedStage::new(vec![Ok(Default::default())]));
        let executor = fixture
            .harness
            .executor_with(fixture.harness.calls_with(Stage::Enrich, enrich.clone()));
        let dispatcher = fixture.dispatcher(executor);
        let now = Utc::now();
        let mut job = Job::new(JobKind::Enrich, "p1", 3, now);
        job.status = JobStatus::RetryScheduled;
        job.attempt = 1;
        job.next_run_at = Some(now + chrono::Duration::hours(1));
        fixture.store.put(job.clone()).await;

        // two deliveries racing, e.g. a sweep requeue plus the scheduled one
        let (first, second) = tokio::join!(dispatcher.process(job.id), dispatcher.process(job.id));
        assert_eq!(first.unwrap(), Delivery::NotDue);
        assert_eq!(second.unwrap(), Delivery::NotDue);
        assert_eq!(enrich.call_count(), 0);

        let stored = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::RetryScheduled);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.next_run_at, job.next_run_at);
        assert_eq!(fixture.queue.receive(Duration::from_millis(20)).await.unwrap(), None);
        assert_eq!(fixture.queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let fixture = Fixture::new();
        let validate = Arc::new(ScriptedStage::new(vec![Err(StageError::permanent("HTTP 422"))]));
        let executor = fixture
            .harness
            .executor_with(fixture.harness.calls_with(Stage::Validate, validate));
        let dispatcher = fixture.dispatcher(executor);
        let job = dispatcher.submit(JobKind::Publish, "p1").await.unwrap();
        assert_eq!(job.stage, Stage::Validate);

        dispatcher.process(job.id).await.unwrap();
        let job = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.last_error.unwrap().class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn success_moves_to_next_stage_and_requeues() {
        let fixture = Fixture::new();
        let dispatcher = fixture.dispatcher(fixture.harness.executor());
        let job = dispatcher.submit(JobKind::Scrape, "p1").await.unwrap();
        assert_eq!(fixture.queue.receive(Duration::from_millis(10)).await.unwrap(), Some(job.id));

        dispatcher.process(job.id).await.unwrap();
        let job = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(job.stage, Stage::Enrich);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(fixture.queue.in_flight_len().await, 0);
        assert_eq!(fixture.queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn veto_pauses_without_consuming_attempts() {
        let fixture = Fixture::new();
        let dispatcher = fixture.dispatcher(fixture.harness.executor());
        let mut job = Job::new(JobKind::Publish, "no-snapshot", 3, Utc::now());
        job.stage = Stage::Publish;
        fixture.store.put(job.clone()).await;

        assert_eq!(
            dispatcher.process(job.id).await.unwrap(),
            Delivery::Applied(JobStatus::Paused)
        );
        let job = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 0);
        assert_eq!(job.last_error.unwrap().class, ErrorClass::Veto);
        assert_eq!(fixture.harness.marketplace.active_count(), 0);
    }

    #[tokio::test]
    async fn running_job_delivery_is_discarded() {
        let fixture = Fixture::new();
        let scrape = Arc::new(ScriptedStage::new(vec![Ok(Default::default())]));
        let executor = fixture
            .harness
            .executor_with(fixture.harness.calls_with(Stage::Scrape, scrape.clone()));
        let dispatcher = fixture.dispatcher(executor);
        let mut job = Job::new(JobKind::Scrape, "p1", 3, Utc::now());
        job.status = JobStatus::Running;
        fixture.store.put(job.clone()).await;

        assert_eq!(dispatcher.process(job.id).await.unwrap(), Delivery::Duplicate);
        assert_eq!(scrape.call_count(), 0);
    }

    #[tokio::test]
    async fn redelivered_publish_keeps_one_listing() {
        let fixture = Fixture::new();
        fixture.harness.profitable("p1");
        let dispatcher = fixture.dispatcher(fixture.harness.executor());
        let mut job = Job::new(JobKind::Publish, "p1", 3, Utc::now());
        job.stage = Stage::Publish;
        fixture.store.put(job.clone()).await;
        dispatcher.process(job.id).await.unwrap();

        // a worker that crashed after publishing but before recording it
        fixture.store.put(job.clone()).await;
        dispatcher.process(job.id).await.unwrap();

        assert_eq!(fixture.harness.marketplace.active_count(), 1);
        assert_eq!(fixture.harness.marketplace.listing("p1").unwrap().publish_calls, 2);
        let job = dispatcher.status(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.stage, Stage::Done);
    }

    #[tokio::test]
    async fn workers_drive_a_job_to_completion() {
        let fixture = Fixture::new();
        fixture.harness.profitable("p1");
        let dispatcher = fixture.dispatcher(fixture.harness.executor());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = dispatcher.spawn(2, shutdown_rx);

        let job = dispatcher.submit(JobKind::Scrape, "p1").await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = dispatcher.status(job.id).await.unwrap().unwrap();
                if current.status.is_terminal() {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job finished");

        assert_eq!(finished.status, JobStatus::Succeeded);
        assert_eq!(fixture.harness.marketplace.active_count(), 1);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
