//! Canary rollout: caps how many targets may be live, supports an emergency
//! halt, and trips a circuit breaker when publishing keeps failing.

use crate::metrics;
use crate::models::{Job, RolloutPhase};
use crate::safety::{ActiveTargets, GateDecision, MemorySafetyConfig, SafetyConfig, SafetyInputError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{error, info, warn};

pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const ERROR_RATE_THRESHOLD: f64 = 0.05;
/// Publishes observed before the error rate is considered.
pub const MIN_RATE_SAMPLE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    Normal,
    /// Operator lowering the cap during an incident.
    Incident,
}

#[derive(Debug, Error, PartialEq)]
pub enum RolloutError {
    #[error("phase cap cannot drop from {from} to {to} outside an incident")]
    CapDecrease { from: u64, to: u64 },
    #[error("phase cannot go back from {from} to {to} outside an incident")]
    PhaseDecrease { from: u32, to: u32 },
    #[error("phase number must be at least 1")]
    InvalidPhase,
    #[error(transparent)]
    Store(#[from] SafetyInputError),
}

/// Writable side of the rollout phase. Only operator actions write.
#[async_trait]
pub trait PhaseStore: SafetyConfig {
    async fn write_phase(&self, phase: &RolloutPhase) -> Result<(), SafetyInputError>;
}

#[async_trait]
impl PhaseStore for MemorySafetyConfig {
    async fn write_phase(&self, phase: &RolloutPhase) -> Result<(), SafetyInputError> {
        self.store_phase(phase.clone());
        Ok(())
    }
}

/// Phase caps for a staged release.
pub fn default_plan() -> Vec<RolloutPhase> {
    [3, 10, 25, 100]
        .into_iter()
        .enumerate()
        .map(|(index, cap)| RolloutPhase {
            phase: index as u32 + 1,
            max_active_targets: cap,
            halted_at: None,
        })
        .collect()
}

impl RolloutPhase {
    /// Validates an operator-requested move to `phase` with cap `max_active_targets`.
    /// A halt in effect carries over.
    pub fn transition(
        &self,
        phase: u32,
        max_active_targets: u64,
        mode: TransitionMode,
    ) -> Result<RolloutPhase, RolloutError> {
        if phase == 0 {
            return Err(RolloutError::InvalidPhase);
        }
        if mode == TransitionMode::Normal {
            if max_active_targets < self.max_active_targets {
                return Err(RolloutError::CapDecrease {
                    from: self.max_active_targets,
                    to: max_active_targets,
                });
            }
            if phase < self.phase {
                return Err(RolloutError::PhaseDecrease {
                    from: self.phase,
                    to: phase,
                });
            }
        }
        Ok(RolloutPhase {
            phase,
            max_active_targets,
            halted_at: self.halted_at,
        })
    }

    pub fn halted(&self, at: DateTime<Utc>) -> RolloutPhase {
        RolloutPhase {
            halted_at: Some(self.halted_at.unwrap_or(at)),
            ..self.clone()
        }
    }

    pub fn resumed(&self) -> RolloutPhase {
        RolloutPhase {
            halted_at: None,
            ..self.clone()
        }
    }
}

/// Tracks publish outcomes. Trips after [`MAX_CONSECUTIVE_ERRORS`] failures in
/// a row, or when the error rate exceeds [`ERROR_RATE_THRESHOLD`] once at least
/// [`MIN_RATE_SAMPLE`] publishes have been seen. Stays tripped until reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitBreaker {
    consecutive_errors: u32,
    total: u32,
    errors: u32,
    trip_reason: Option<String>,
}

impl CircuitBreaker {
    pub fn record_success(&mut self) {
        self.total += 1;
        self.consecutive_errors = 0;
    }

    pub fn record_failure(&mut self, message: &str) {
        self.total += 1;
        self.errors += 1;
        self.consecutive_errors += 1;
        if self.trip_reason.is_some() {
            return;
        }
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            self.trip_reason = Some(format!(
                "{} consecutive publish errors, last: {message}",
                self.consecutive_errors
            ));
        } else if self.total >= MIN_RATE_SAMPLE {
            let rate = f64::from(self.errors) / f64::from(self.total);
            if rate > ERROR_RATE_THRESHOLD {
                self.trip_reason = Some(format!(
                    "publish error rate {:.1}% over {} attempts",
                    rate * 100.0,
                    self.total
                ));
            }
        }
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.trip_reason.as_deref()
    }

    pub fn reset(&mut self) {
        *self = CircuitBreaker::default();
    }
}

/// In-flight publishes per target.
type Reservations = Arc<Mutex<HashMap<String, u64>>>;

fn lock_reservations(reservations: &Reservations) -> MutexGuard<'_, HashMap<String, u64>> {
    reservations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A publish slot held for the duration of one publish call. It counts
/// against the phase cap until dropped.
#[derive(Debug)]
pub struct PublishSlot {
    target_id: String,
    reservations: Reservations,
}

impl Drop for PublishSlot {
    fn drop(&mut self) {
        let mut reservations = lock_reservations(&self.reservations);
        if let Some(held) = reservations.get_mut(&self.target_id) {
            *held = held.saturating_sub(1);
            if *held == 0 {
                reservations.remove(&self.target_id);
            }
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Granted(PublishSlot),
    Denied(String),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

#[derive(Debug, Default)]
pub struct RolloutController {
    breaker: Mutex<CircuitBreaker>,
    reservations: Reservations,
    admission: tokio::sync::Mutex<()>,
}

impl RolloutController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a publish slot if the phase, the breaker and the cap allow it.
    /// Live targets plus slots held by other targets count against the cap; a
    /// target that is already live does not count twice. Failing to read any
    /// input is a veto.
    pub async fn admit(
        &self,
        job: &Job,
        config: &dyn SafetyConfig,
        active: &dyn ActiveTargets,
    ) -> Admission {
        let phase = match config.rollout_phase().await {
            Ok(phase) => phase,
            Err(err) => return Admission::Denied(self.veto(job, format!("rollout phase unavailable: {err}"))),
        };
        if let GateDecision::Veto(reason) = self.decide(job, &phase, 0) {
            return Admission::Denied(reason);
        }

        // One admission at a time. Slots are read before the live count, so a
        // publish that finishes in between is seen in at least one of them.
        let _turn = self.admission.lock().await;
        let reserved = self.reserved_except(&job.target_id);
        let live = match active.active_target_count().await {
            Ok(count) => count,
            Err(err) => {
                return Admission::Denied(self.veto(job, format!("active target count unavailable: {err}")));
            }
        };
        let already_live = match active.is_active(&job.target_id).await {
            Ok(found) => found,
            Err(err) => {
                return Admission::Denied(self.veto(job, format!("target state unavailable: {err}")));
            }
        };
        let occupied = live.saturating_sub(u64::from(already_live)) + reserved;
        match self.decide(job, &phase, occupied) {
            GateDecision::Allow => Admission::Granted(self.reserve(&job.target_id)),
            GateDecision::Veto(reason) => Admission::Denied(reason),
        }
    }

    pub fn decide(&self, job: &Job, phase: &RolloutPhase, active_targets: u64) -> GateDecision {
        if let Some(at) = phase.halted_at {
            return GateDecision::Veto(self.veto(job, format!("rollout halted at {}", at.to_rfc3339())));
        }
        if let Some(reason) = self.breaker().trip_reason() {
            return GateDecision::Veto(self.veto(job, format!("circuit breaker open: {reason}")));
        }
        if active_targets >= phase.max_active_targets {
            return GateDecision::Veto(self.veto(
                job,
                format!(
                    "phase cap reached: {active_targets}/{} active in phase {}",
                    phase.max_active_targets, phase.phase
                ),
            ));
        }
        GateDecision::Allow
    }

    /// Targets with a publish call in flight.
    pub fn reserved_slots(&self) -> u64 {
        lock_reservations(&self.reservations).len() as u64
    }

    fn reserved_except(&self, target_id: &str) -> u64 {
        lock_reservations(&self.reservations)
            .keys()
            .filter(|reserved| reserved.as_str() != target_id)
            .count() as u64
    }

    fn reserve(&self, target_id: &str) -> PublishSlot {
        *lock_reservations(&self.reservations)
            .entry(target_id.to_string())
            .or_insert(0) += 1;
        PublishSlot {
            target_id: target_id.to_string(),
            reservations: self.reservations.clone(),
        }
    }

    pub async fn transition(
        &self,
        store: &dyn PhaseStore,
        phase: u32,
        max_active_targets: u64,
        mode: TransitionMode,
    ) -> Result<RolloutPhase, RolloutError> {
        let current = store.rollout_phase().await?;
        let next = current.transition(phase, max_active_targets, mode)?;
        store.write_phase(&next).await?;
        info!(
            target = "relist.rollout",
            from_phase = current.phase,
            phase = next.phase,
            max_active_targets = next.max_active_targets,
            mode = ?mode,
            "rollout_phase_changed"
        );
        Ok(next)
    }

    /// Emergency stop. In-flight stages finish; nothing new reaches publish.
    pub async fn halt(&self, store: &dyn PhaseStore, at: DateTime<Utc>) -> Result<RolloutPhase, RolloutError> {
        let halted = store.rollout_phase().await?.halted(at);
        store.write_phase(&halted).await?;
        error!(target = "relist.rollout", phase = halted.phase, "rollout_halted");
        Ok(halted)
    }

    pub async fn resume(&self, store: &dyn PhaseStore) -> Result<RolloutPhase, RolloutError> {
        let resumed = store.rollout_phase().await?.resumed();
        store.write_phase(&resumed).await?;
        info!(target = "relist.rollout", phase = resumed.phase, "rollout_resumed");
        Ok(resumed)
    }

    pub fn record_publish_success(&self) {
        self.breaker().record_success();
    }

    pub fn record_publish_failure(&self, message: &str) {
        let mut breaker = self.breaker();
        let was_open = breaker.trip_reason().is_some();
        breaker.record_failure(message);
        if !was_open && let Some(reason) = breaker.trip_reason() {
            error!(target = "relist.rollout", reason = %reason, "circuit_breaker_tripped");
            metrics::breaker_tripped();
        }
    }

    pub fn breaker_state(&self) -> CircuitBreaker {
        self.breaker().clone()
    }

    pub fn reset_breaker(&self) {
        info!(target = "relist.rollout", "circuit_breaker_reset");
        self.breaker().reset();
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn veto(&self, job: &Job, reason: String) -> String {
        warn!(
            target = "relist.rollout",
            job_id = %job.id,
            target_id = %job.target_id,
            reason = %reason,
            "rollout_veto"
        );
        metrics::gate_veto("rollout");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use crate::remote::{MemoryMarketplace, StageCall};
    use std::time::Duration;

    fn job(target: &str) -> Job {
        Job::new(JobKind::Publish, target, 3, Utc::now())
    }

    fn phase(cap: u64) -> RolloutPhase {
        RolloutPhase {
            phase: 1,
            max_active_targets: cap,
            halted_at: None,
        }
    }

    #[tokio::test]
    async fn cap_blocks_until_a_target_is_deactivated() {
        let controller = RolloutController::new();
        let config = MemorySafetyConfig::new(phase(2));
        let marketplace = MemoryMarketplace::new();
        for target in ["a", "b"] {
            marketplace.call(target, Duration::from_secs(1)).await.unwrap();
        }

        let admission = controller.admit(&job("c"), &config, &marketplace).await;
        assert!(matches!(admission, Admission::Denied(reason) if reason.contains("phase cap reached")));

        marketplace.compensate("a").await.unwrap();
        let admission = controller.admit(&job("c"), &config, &marketplace).await;
        assert!(admission.is_granted());
    }

    #[tokio::test]
    async fn concurrent_admissions_reserve_distinct_slots() {
        let controller = Arc::new(RolloutController::new());
        let config = Arc::new(MemorySafetyConfig::new(phase(2)));
        let marketplace = Arc::new(MemoryMarketplace::new());

        let mut handles = Vec::new();
        for index in 0..6 {
            let controller = controller.clone();
            let config = config.clone();
            let marketplace = marketplace.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .admit(&job(&format!("t{index}")), config.as_ref(), marketplace.as_ref())
                    .await
            }));
        }
        let mut slots = Vec::new();
        for handle in handles {
            if let Admission::Granted(slot) = handle.await.unwrap() {
                slots.push(slot);
            }
        }
        assert_eq!(slots.len(), 2);
        assert_eq!(controller.reserved_slots(), 2);
        assert!(!controller.admit(&job("late"), config.as_ref(), marketplace.as_ref()).await.is_granted());

        drop(slots);
        assert_eq!(controller.reserved_slots(), 0);
        assert!(controller.admit(&job("late"), config.as_ref(), marketplace.as_ref()).await.is_granted());
    }

    #[tokio::test]
    async fn live_target_is_not_counted_against_itself() {
        let controller = RolloutController::new();
        let config = MemorySafetyConfig::new(phase(1));
        let marketplace = MemoryMarketplace::new();
        marketplace.call("a", Duration::from_secs(1)).await.unwrap();

        // redelivered publish of a target that is already live
        assert!(controller.admit(&job("a"), &config, &marketplace).await.is_granted());
        assert!(!controller.admit(&job("b"), &config, &marketplace).await.is_granted());
    }

    #[tokio::test]
    async fn slot_held_by_one_target_blocks_another() {
        let controller = RolloutController::new();
        let config = MemorySafetyConfig::new(phase(1));
        let marketplace = MemoryMarketplace::new();

        let held = controller.admit(&job("a"), &config, &marketplace).await;
        assert!(held.is_granted());
        let other = controller.admit(&job("b"), &config, &marketplace).await;
        assert!(matches!(other, Admission::Denied(reason) if reason.contains("1/1")));
        // the same target may publish again while its slot is held
        assert!(controller.admit(&job("a"), &config, &marketplace).await.is_granted());
    }

    #[test]
    fn halt_vetoes_regardless_of_capacity() {
        let controller = RolloutController::new();
        let halted = phase(100).halted(Utc::now());
        assert!(!controller.decide(&job("x"), &halted, 0).is_allowed());
        assert!(controller.decide(&job("x"), &halted.resumed(), 0).is_allowed());
    }

    #[test]
    fn transitions_are_monotonic_outside_incidents() {
        let current = phase(10);
        assert_eq!(
            current.transition(2, 5, TransitionMode::Normal),
            Err(RolloutError::CapDecrease { from: 10, to: 5 })
        );
        let lowered = current.transition(1, 5, TransitionMode::Incident).unwrap();
        assert_eq!(lowered.max_active_targets, 5);
        let next = current.transition(2, 25, TransitionMode::Normal).unwrap();
        assert_eq!(next.phase, 2);
        assert!(current.transition(0, 25, TransitionMode::Normal).is_err());
    }

    #[test]
    fn halt_survives_phase_transition() {
        let halted = phase(3).halted(Utc::now());
        let next = halted.transition(2, 10, TransitionMode::Normal).unwrap();
        assert!(next.halted_at.is_some());
    }

    #[test]
    fn default_plan_caps_never_decrease() {
        let plan = default_plan();
        assert_eq!(plan.first().map(|p| p.max_active_targets), Some(3));
        assert!(plan.windows(2).all(|w| w[0].max_active_targets <= w[1].max_active_targets));
    }

    #[test]
    fn breaker_trips_on_consecutive_errors() {
        let controller = RolloutController::new();
        controller.record_publish_failure("HTTP 500");
        controller.record_publish_failure("HTTP 500");
        assert!(controller.decide(&job("x"), &phase(10), 0).is_allowed());
        controller.record_publish_failure("HTTP 502");
        let decision = controller.decide(&job("x"), &phase(10), 0);
        assert!(matches!(decision, GateDecision::Veto(reason) if reason.contains("circuit breaker")));

        controller.reset_breaker();
        assert!(controller.decide(&job("x"), &phase(10), 0).is_allowed());
    }

    #[test]
    fn breaker_trips_on_error_rate() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_success();
        }
        breaker.record_failure("timeout");
        assert!(breaker.trip_reason().is_some(), "1 of 5 is 20%");

        let mut healthy = CircuitBreaker::default();
        for _ in 0..30 {
            healthy.record_success();
        }
        healthy.record_failure("timeout");
        assert!(healthy.trip_reason().is_none(), "1 of 31 is under 5%");
    }

    #[tokio::test]
    async fn operator_actions_persist_the_phase() {
        let controller = RolloutController::new();
        let config = MemorySafetyConfig::new(phase(3));

        let next = controller
            .transition(&config, 2, 10, TransitionMode::Normal)
            .await
            .unwrap();
        assert_eq!(config.current_phase(), next);

        let err = controller
            .transition(&config, 3, 5, TransitionMode::Normal)
            .await
            .unwrap_err();
        assert_eq!(err, RolloutError::CapDecrease { from: 10, to: 5 });

        controller.halt(&config, Utc::now()).await.unwrap();
        assert!(!controller.admit(&job("x"), &config, &MemoryMarketplace::new()).await.is_granted());
        controller.resume(&config).await.unwrap();
        assert!(controller.admit(&job("x"), &config, &MemoryMarketplace::new()).await.is_granted());
    }
}
