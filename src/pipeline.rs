//! Runs one stage of a claimed job and reports what should happen next.

use crate::backoff::backoff;
use crate::config::StagePolicies;
use crate::models::{Job, Stage};
use crate::remote::{StageCalls, StageError};
use crate::rollout::{Admission, PublishSlot, RolloutController};
use crate::safety::{ActiveTargets, GateDecision, PricingInputs, SafetyConfig, SafetyGate};
use std::{sync::Arc, time::Duration, time::Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Stage finished; the job moves to the given stage (`Done` means complete).
    Advanced(Stage),
    /// Transient failure; try again after `delay`.
    RetryLater { delay: Duration, reason: String },
    /// Permanent failure; no further attempts.
    Fatal(String),
    /// A safety or rollout gate held the job back before publish.
    Paused(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Advanced(_) => "advanced",
            Outcome::RetryLater { .. } => "retry_later",
            Outcome::Fatal(_) => "fatal",
            Outcome::Paused(_) => "paused",
        }
    }
}

/// Collaborators consulted before the publish stage.
#[derive(Clone)]
pub struct PublishGates {
    pub gate: SafetyGate,
    pub rollout: Arc<RolloutController>,
    pub safety: Arc<dyn SafetyConfig>,
    pub pricing: Arc<dyn PricingInputs>,
    pub active: Arc<dyn ActiveTargets>,
}

#[derive(Clone)]
pub struct StageExecutor {
    calls: StageCalls,
    policies: Arc<StagePolicies>,
    gates: PublishGates,
}

impl StageExecutor {
    pub fn new(calls: StageCalls, policies: Arc<StagePolicies>, gates: PublishGates) -> Self {
        Self {
            calls,
            policies,
            gates,
        }
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    pub fn rollout(&self) -> &RolloutController {
        &self.gates.rollout
    }

    /// Never fails: every stage error becomes an [`Outcome`].
    pub async fn execute(&self, job: &Job) -> Outcome {
        let (Some(next), Some(call)) = (job.stage.next(), self.calls.for_stage(job.stage)) else {
            return Outcome::Fatal(format!("job {} has no stage left to run", job.id));
        };

        // held until the publish call returns
        let _slot = if job.stage == Stage::Publish {
            match self.admit_publish(job).await {
                Ok(slot) => Some(slot),
                Err(reason) => return Outcome::Paused(reason),
            }
        } else {
            None
        };

        let policy = self.policies.for_stage(job.stage);
        let started = Instant::now();
        let result = match tokio::time::timeout(policy.timeout(), call.call(&job.target_id, policy.timeout())).await {
            Ok(result) => result,
            Err(_) => Err(StageError::transient(format!(
                "{} timed out after {}ms",
                job.stage, policy.timeout_ms
            ))),
        };
        crate::metrics::stage_elapsed(job.stage, started.elapsed().as_millis());

        if job.stage == Stage::Publish {
            match &result {
                Ok(_) => self.gates.rollout.record_publish_success(),
                Err(err) => self.gates.rollout.record_publish_failure(&err.to_string()),
            }
        }

        match result {
            Ok(output) => {
                debug!(
                    target = "relist.pipeline",
                    job_id = %job.id,
                    stage = %job.stage,
                    external_id = ?output.external_id,
                    "stage_succeeded"
                );
                Outcome::Advanced(next)
            }
            Err(StageError::Transient {
                message,
                retry_after,
            }) => {
                let delay = self.retry_delay(job, retry_after);
                warn!(
                    target = "relist.pipeline",
                    job_id = %job.id,
                    stage = %job.stage,
                    attempt = job.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "stage_transient_failure"
                );
                Outcome::RetryLater {
                    delay,
                    reason: message,
                }
            }
            Err(StageError::Permanent(message)) => {
                warn!(
                    target = "relist.pipeline",
                    job_id = %job.id,
                    stage = %job.stage,
                    error = %message,
                    "stage_permanent_failure"
                );
                Outcome::Fatal(message)
            }
        }
    }

    /// The safety gate runs first; the rollout controller only if it allows.
    async fn admit_publish(&self, job: &Job) -> Result<PublishSlot, String> {
        let gates = &self.gates;
        if let GateDecision::Veto(reason) = gates
            .gate
            .check(job, gates.pricing.as_ref(), gates.safety.as_ref())
            .await
        {
            return Err(reason);
        }
        match gates
            .rollout
            .admit(job, gates.safety.as_ref(), gates.active.as_ref())
            .await
        {
            Admission::Granted(slot) => Ok(slot),
            Admission::Denied(reason) => Err(reason),
        }
    }

    fn retry_delay(&self, job: &Job, retry_after: Option<Duration>) -> Duration {
        let policy = self.policies.for_stage(job.stage);
        let computed = backoff(policy, job.attempt + 1);
        match retry_after {
            Some(hint) => computed.max(hint).min(policy.max_delay()),
            None => computed,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{JobKind, Marketplace, ProfitThreshold, RolloutPhase, TargetSnapshot};
    use crate::remote::{MemoryMarketplace, StageCall, StageResult};
    use crate::safety::{ContentRules, MemoryPricingInputs, MemorySafetyConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Replays a fixed sequence of results, then keeps returning the last one.
    pub(crate) struct ScriptedStage {
        script: Mutex<Vec<Result<StageResult, StageError>>>,
        pub(crate) calls: Mutex<u32>,
    }

    impl ScriptedStage {
        pub(crate) fn new(script: Vec<Result<StageResult, StageError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StageCall for ScriptedStage {
        async fn call(&self, _target_id: &str, _timeout: Duration) -> Result<StageResult, StageError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    pub(crate) struct SlowStage(pub Duration);

    #[async_trait]
    impl StageCall for SlowStage {
        async fn call(&self, _target_id: &str, _timeout: Duration) -> Result<StageResult, StageError> {
            tokio::time::sleep(self.0).await;
            Ok(StageResult::default())
        }
    }

    /// Publishes to the marketplace after a pause.
    struct DelayedPublish {
        marketplace: Arc<MemoryMarketplace>,
        delay: Duration,
    }

    #[async_trait]
    impl StageCall for DelayedPublish {
        async fn call(&self, target_id: &str, timeout: Duration) -> Result<StageResult, StageError> {
            tokio::time::sleep(self.delay).await;
            self.marketplace.call(target_id, timeout).await
        }
    }

    pub(crate) struct Harness {
        pub(crate) marketplace: Arc<MemoryMarketplace>,
        pub(crate) pricing: Arc<MemoryPricingInputs>,
        pub(crate) safety: Arc<MemorySafetyConfig>,
        pub(crate) rollout: Arc<RolloutController>,
        pub(crate) policies: Arc<StagePolicies>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let pricing = Arc::new(MemoryPricingInputs::new());
            pricing.set_rate("USD", "JPY", 150.0);
            let safety = Arc::new(
                MemorySafetyConfig::new(RolloutPhase {
                    phase: 1,
                    max_active_targets: 10,
                    halted_at: None,
                })
                .with_threshold(ProfitThreshold {
                    marketplace: Marketplace::EbayUs,
                    min_profit_rate: 0.10,
                    min_profit_amount: 3_000.0,
                    alert_profit_rate: 0.15,
                    is_active: true,
                    is_dry_run: false,
                }),
            );
            let mut policies = StagePolicies::default();
            for policy in [
                &mut policies.scrape,
                &mut policies.enrich,
                &mut policies.validate,
                &mut policies.price,
                &mut policies.publish,
            ] {
                policy.base_delay_ms = 100;
                policy.max_delay_ms = 10_000;
                policy.timeout_ms = 200;
            }
            Self {
                marketplace: Arc::new(MemoryMarketplace::new()),
                pricing,
                safety,
                rollout: Arc::new(RolloutController::new()),
                policies: Arc::new(policies),
            }
        }

        pub(crate) fn profitable(&self, target_id: &str) {
            self.pricing.insert_snapshot(TargetSnapshot {
                target_id: target_id.into(),
                marketplace: Marketplace::EbayUs,
                title: "Citizen chronograph watch".into(),
                title_en: None,
                brand: Some("Citizen".into()),
                category: Some("watch".into()),
                sale_price: 200.0,
                sale_currency: "USD".into(),
                source_cost: 15_000.0,
                source_currency: "JPY".into(),
                fee_rate: 0.13,
            });
        }

        pub(crate) fn executor_with(&self, calls: StageCalls) -> StageExecutor {
            StageExecutor::new(
                calls,
                self.policies.clone(),
                PublishGates {
                    gate: SafetyGate::new(ContentRules::default()),
                    rollout: self.rollout.clone(),
                    safety: self.safety.clone(),
                    pricing: self.pricing.clone(),
                    active: self.marketplace.clone(),
                },
            )
        }

        pub(crate) fn executor(&self) -> StageExecutor {
            self.executor_with(StageCalls::demo(self.marketplace.clone()))
        }

        pub(crate) fn calls_with(&self, stage: Stage, call: Arc<dyn StageCall>) -> StageCalls {
            let mut calls = StageCalls::demo(self.marketplace.clone());
            match stage {
                Stage::Scrape => calls.scrape = call,
                Stage::Enrich => calls.enrich = call,
                Stage::Validate => calls.validate = call,
                Stage::Price => calls.price = call,
                Stage::Publish | Stage::Done => calls.publish = call,
            }
            calls
        }
    }

    fn job_at(stage: Stage, target: &str) -> Job {
        let mut job = Job::new(JobKind::Scrape, target, 3, Utc::now());
        job.stage = stage;
        job
    }

    #[tokio::test]
    async fn success_advances_to_next_stage() {
        let harness = Harness::new();
        let outcome = harness.executor().execute(&job_at(Stage::Enrich, "p1")).await;
        assert_eq!(outcome, Outcome::Advanced(Stage::Validate));
    }

    #[tokio::test]
    async fn publish_success_reaches_done() {
        let harness = Harness::new();
        harness.profitable("p1");
        let outcome = harness.executor().execute(&job_at(Stage::Publish, "p1")).await;
        assert_eq!(outcome, Outcome::Advanced(Stage::Done));
        assert_eq!(harness.marketplace.active_count(), 1);
    }

    #[tokio::test]
    async fn transient_error_schedules_retry_within_cap() {
        let harness = Harness::new();
        let stage = Arc::new(ScriptedStage::new(vec![Err(StageError::transient("HTTP 503"))]));
        let executor = harness.executor_with(harness.calls_with(Stage::Enrich, stage));
        match executor.execute(&job_at(Stage::Enrich, "p1")).await {
            Outcome::RetryLater { delay, reason } => {
                assert!(delay >= Duration::from_millis(100));
                assert!(delay <= Duration::from_millis(150));
                assert_eq!(reason, "HTTP 503");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_after_hint_lengthens_delay() {
        let harness = Harness::new();
        let stage = Arc::new(ScriptedStage::new(vec![Err(StageError::Transient {
            message: "HTTP 429".into(),
            retry_after: Some(Duration::from_secs(5)),
        })]));
        let executor = harness.executor_with(harness.calls_with(Stage::Price, stage));
        let outcome = executor.execute(&job_at(Stage::Price, "p1")).await;
        assert!(matches!(outcome, Outcome::RetryLater { delay, .. } if delay == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn permanent_error_is_fatal() {
        let harness = Harness::new();
        let stage = Arc::new(ScriptedStage::new(vec![Err(StageError::permanent("HTTP 422"))]));
        let executor = harness.executor_with(harness.calls_with(Stage::Validate, stage));
        let outcome = executor.execute(&job_at(Stage::Validate, "p1")).await;
        assert_eq!(outcome, Outcome::Fatal("HTTP 422".into()));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let harness = Harness::new();
        let stage = Arc::new(SlowStage(Duration::from_secs(2)));
        let executor = harness.executor_with(harness.calls_with(Stage::Scrape, stage));
        let outcome = executor.execute(&job_at(Stage::Scrape, "p1")).await;
        assert!(matches!(outcome, Outcome::RetryLater { reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn safety_veto_pauses_without_calling_publish() {
        let harness = Harness::new();
        let publish = Arc::new(ScriptedStage::new(vec![Ok(StageResult::default())]));
        let executor = harness.executor_with(harness.calls_with(Stage::Publish, publish.clone()));
        // no snapshot for the target: gate fails closed
        let outcome = executor.execute(&job_at(Stage::Publish, "unknown")).await;
        assert!(matches!(outcome, Outcome::Paused(_)));
        assert_eq!(publish.call_count(), 0);
    }

    #[tokio::test]
    async fn halted_rollout_pauses_publish() {
        let harness = Harness::new();
        harness.profitable("p1");
        let halted = harness.safety.current_phase().halted(Utc::now());
        harness.safety.store_phase(halted);
        let outcome = harness.executor().execute(&job_at(Stage::Publish, "p1")).await;
        assert!(matches!(outcome, Outcome::Paused(reason) if reason.contains("halted")));
        assert_eq!(harness.marketplace.active_count(), 0);
    }

    #[tokio::test]
    async fn publish_failures_feed_the_breaker() {
        let harness = Harness::new();
        harness.profitable("p1");
        let publish = Arc::new(ScriptedStage::new(vec![Err(StageError::transient("HTTP 500"))]));
        let executor = harness.executor_with(harness.calls_with(Stage::Publish, publish.clone()));
        for _ in 0..3 {
            executor.execute(&job_at(Stage::Publish, "p1")).await;
        }
        let outcome = executor.execute(&job_at(Stage::Publish, "p1")).await;
        assert!(matches!(outcome, Outcome::Paused(reason) if reason.contains("circuit breaker")));
        assert_eq!(publish.call_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_publishes_stay_within_phase_cap() {
        let harness = Harness::new();
        harness.safety.store_phase(RolloutPhase {
            phase: 1,
            max_active_targets: 1,
            halted_at: None,
        });
        let publish = Arc::new(DelayedPublish {
            marketplace: harness.marketplace.clone(),
            delay: Duration::from_millis(50),
        });
        let executor = harness.executor_with(harness.calls_with(Stage::Publish, publish));

        let mut handles = Vec::new();
        for target in ["p1", "p2", "p3", "p4"] {
            harness.profitable(target);
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                executor.execute(&job_at(Stage::Publish, target)).await
            }));
        }
        let mut published = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Outcome::Advanced(Stage::Done) => published += 1,
                Outcome::Paused(reason) => assert!(reason.contains("phase cap"), "{reason}"),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(published, 1);
        assert_eq!(harness.marketplace.active_count(), 1);
        assert_eq!(harness.rollout.reserved_slots(), 0);
    }

    #[tokio::test]
    async fn failed_publish_releases_its_slot() {
        let harness = Harness::new();
        harness.safety.store_phase(RolloutPhase {
            phase: 1,
            max_active_targets: 1,
            halted_at: None,
        });
        harness.profitable("p1");
        harness.profitable("p2");
        let failing = Arc::new(ScriptedStage::new(vec![Err(StageError::permanent("HTTP 400"))]));
        let outcome = harness
            .executor_with(harness.calls_with(Stage::Publish, failing))
            .execute(&job_at(Stage::Publish, "p1"))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
        assert_eq!(harness.rollout.reserved_slots(), 0);

        let outcome = harness.executor().execute(&job_at(Stage::Publish, "p2")).await;
        assert_eq!(outcome, Outcome::Advanced(Stage::Done));
    }

    #[tokio::test]
    async fn done_stage_is_fatal() {
        let harness = Harness::new();
        let outcome = harness.executor().execute(&job_at(Stage::Done, "p1")).await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }
}
