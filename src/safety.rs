//! Safety gate evaluated immediately before publish.
//!
//! Rule precedence:
//! 1. the price cap always applies, whitelisted brand or not;
//! 2. excluded keywords veto unless the brand is whitelisted;
//! 3. the profit rule vetoes only when both the margin rate and the absolute
//!    profit fall short, and only logs when the threshold is in dry-run.
//!
//! Any failure to gather inputs is a veto.

use crate::metrics;
use crate::models::{Job, Marketplace, ProfitThreshold, RolloutPhase, TargetSnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, sync::RwLock};
use thiserror::Error;
use tracing::{info, warn};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    Veto(String),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyInputError {
    #[error("missing {0}")]
    Missing(String),
    #[error("invalid {0}")]
    Invalid(String),
    #[error("safety source unavailable: {0}")]
    Unavailable(String),
}

/// Read-only safety configuration.
#[async_trait]
pub trait SafetyConfig: Send + Sync {
    async fn profit_threshold(
        &self,
        marketplace: Marketplace,
    ) -> Result<Option<ProfitThreshold>, SafetyInputError>;

    async fn rollout_phase(&self) -> Result<RolloutPhase, SafetyInputError>;
}

/// Targets currently live (published and not deactivated).
#[async_trait]
pub trait ActiveTargets: Send + Sync {
    async fn active_target_count(&self) -> Result<u64, SafetyInputError>;

    async fn is_active(&self, target_id: &str) -> Result<bool, SafetyInputError>;
}

/// Listing data and exchange rates for the profit check.
#[async_trait]
pub trait PricingInputs: Send + Sync {
    async fn snapshot(&self, target_id: &str) -> Result<TargetSnapshot, SafetyInputError>;

    /// Units of `to` per one unit of `from`.
    async fn exchange_rate(&self, from: &str, to: &str) -> Result<f64, SafetyInputError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ContentRules {
    pub excluded_keywords: Vec<String>,
    pub brand_whitelist: Vec<String>,
    /// Upper bound on the source product price, in source currency.
    pub price_cap: Option<f64>,
}

impl Default for ContentRules {
    fn default() -> Self {
        let keywords = [
            "battery", "lithium", "knife", "blade", "weapon", "gun", "explosive", "medicine",
            "drug", "cosmetic", "food", "liquid", "alcohol", "fake", "replica", "copy",
            "バッテリー", "電池", "リチウム", "ナイフ", "刃物", "武器", "銃", "火薬", "爆発",
            "医薬品", "化粧品", "食品", "液体", "アルコール", "偽", "レプリカ", "コピー",
        ];
        Self {
            excluded_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            brand_whitelist: Vec::new(),
            price_cap: Some(900_000.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfitBreakdown {
    /// Sale price converted to the source currency.
    pub revenue: f64,
    pub fee: f64,
    pub cost: f64,
    pub net_profit: f64,
    pub margin_rate: f64,
}

pub fn profit_breakdown(snapshot: &TargetSnapshot, rate: f64) -> Result<ProfitBreakdown, SafetyInputError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SafetyInputError::Invalid(format!("exchange rate {rate}")));
    }
    if !snapshot.sale_price.is_finite() || snapshot.sale_price <= 0.0 {
        return Err(SafetyInputError::Invalid(format!("sale price {}", snapshot.sale_price)));
    }
    if !snapshot.source_cost.is_finite() || snapshot.source_cost < 0.0 {
        return Err(SafetyInputError::Invalid(format!("source cost {}", snapshot.source_cost)));
    }
    if !snapshot.fee_rate.is_finite() || !(0.0..1.0).contains(&snapshot.fee_rate) {
        return Err(SafetyInputError::Invalid(format!("fee rate {}", snapshot.fee_rate)));
    }
    let revenue = snapshot.sale_price * rate;
    let fee = revenue * snapshot.fee_rate;
    let net_profit = revenue - fee - snapshot.source_cost;
    Ok(ProfitBreakdown {
        revenue,
        fee,
        cost: snapshot.source_cost,
        net_profit,
        margin_rate: net_profit / revenue,
    })
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    rules: ContentRules,
}

impl SafetyGate {
    pub fn new(rules: ContentRules) -> Self {
        Self { rules }
    }

    /// Gathers inputs for `job` and evaluates. The exchange rate is fetched on
    /// every check, never cached.
    pub async fn check(&self, job: &Job, pricing: &dyn PricingInputs, config: &dyn SafetyConfig) -> GateDecision {
        let snapshot = match pricing.snapshot(&job.target_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => return veto_on_error("snapshot", &err),
        };
        let threshold = match config.profit_threshold(snapshot.marketplace).await {
            Ok(threshold) => threshold,
            Err(err) => return veto_on_error("profit threshold", &err),
        };
        let needs_rate = threshold.as_ref().is_some_and(|t| t.is_active);
        let rate = if !needs_rate || snapshot.sale_currency.eq_ignore_ascii_case(&snapshot.source_currency) {
            Ok(1.0)
        } else {
            pricing
                .exchange_rate(&snapshot.sale_currency, &snapshot.source_currency)
                .await
        };
        self.evaluate(&snapshot, threshold.as_ref(), rate)
    }

    /// Pure evaluation over already-fetched inputs.
    pub fn evaluate(
        &self,
        snapshot: &TargetSnapshot,
        threshold: Option<&ProfitThreshold>,
        rate: Result<f64, SafetyInputError>,
    ) -> GateDecision {
        if let Some(reason) = self.price_cap_violation(snapshot) {
            return veto(reason, "price_cap");
        }
        let rate = match rate {
            Ok(rate) => rate,
            Err(err) => return veto_on_error("exchange rate", &err),
        };
        if let Some(reason) = self.content_violation(snapshot) {
            return veto(reason, "content");
        }
        let Some(threshold) = threshold else {
            return veto(
                format!("no profit threshold configured for {}", snapshot.marketplace),
                "profit_config",
            );
        };
        if !threshold.is_active {
            return GateDecision::Allow;
        }
        let breakdown = match profit_breakdown(snapshot, rate) {
            Ok(breakdown) => breakdown,
            Err(err) => return veto_on_error("profit", &err),
        };
        let rate_short = breakdown.margin_rate + EPSILON < threshold.min_profit_rate;
        let amount_short = breakdown.net_profit + EPSILON < threshold.min_profit_amount;
        if rate_short && amount_short {
            let reason = format!(
                "margin {:.4} below {:.4} and profit {:.2} below {:.2}",
                breakdown.margin_rate,
                threshold.min_profit_rate,
                breakdown.net_profit,
                threshold.min_profit_amount
            );
            if threshold.is_dry_run {
                warn!(
                    target = "relist.safety",
                    target_id = %snapshot.target_id,
                    marketplace = %snapshot.marketplace,
                    reason = %reason,
                    "profit_violation_dry_run"
                );
                metrics::gate_dry_run("profit");
                return GateDecision::Allow;
            }
            return veto(reason, "profit");
        }
        if breakdown.margin_rate + EPSILON < threshold.alert_profit_rate {
            warn!(
                target = "relist.safety",
                target_id = %snapshot.target_id,
                margin = breakdown.margin_rate,
                alert_rate = threshold.alert_profit_rate,
                "profit_margin_alert"
            );
            metrics::profit_alert(snapshot.marketplace.code());
        }
        GateDecision::Allow
    }

    fn price_cap_violation(&self, snapshot: &TargetSnapshot) -> Option<String> {
        let cap = self.rules.price_cap?;
        let price = snapshot.source_cost;
        (!price.is_finite() || price > cap + EPSILON)
            .then(|| format!("source price {price:.0} {} above cap {cap:.0}", snapshot.source_currency))
    }

    fn content_violation(&self, snapshot: &TargetSnapshot) -> Option<String> {
        if let Some(brand) = snapshot.brand.as_deref().map(str::trim).filter(|b| !b.is_empty())
            && self
                .rules
                .brand_whitelist
                .iter()
                .any(|allowed| allowed.trim().to_lowercase() == brand.to_lowercase())
        {
            return None;
        }
        let haystack = [
            Some(snapshot.title.as_str()),
            snapshot.title_en.as_deref(),
            snapshot.brand.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
        self.rules
            .excluded_keywords
            .iter()
            .find(|keyword| !keyword.trim().is_empty() && haystack.contains(&keyword.to_lowercase()))
            .map(|keyword| format!("excluded keyword `{keyword}`"))
    }
}

fn veto(reason: String, rule: &'static str) -> GateDecision {
    info!(target = "relist.safety", rule, reason = %reason, "safety_veto");
    metrics::gate_veto(rule);
    GateDecision::Veto(reason)
}

fn veto_on_error(input: &str, err: &SafetyInputError) -> GateDecision {
    veto(format!("safety check failed on {input}: {err}"), "evaluation_error")
}

/// In-memory safety configuration for tests and demo mode.
pub struct MemorySafetyConfig {
    thresholds: RwLock<HashMap<Marketplace, ProfitThreshold>>,
    phase: RwLock<RolloutPhase>,
}

impl MemorySafetyConfig {
    pub fn new(phase: RolloutPhase) -> Self {
        Self {
            thresholds: RwLock::new(HashMap::new()),
            phase: RwLock::new(phase),
        }
    }

    pub fn with_threshold(self, threshold: ProfitThreshold) -> Self {
        self.set_threshold(threshold);
        self
    }

    pub fn set_threshold(&self, threshold: ProfitThreshold) {
        self.thresholds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(threshold.marketplace, threshold);
    }

    /// Replaces the phase. Callers validate transitions via [`crate::rollout`].
    pub fn store_phase(&self, phase: RolloutPhase) {
        *self.phase.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    pub fn current_phase(&self) -> RolloutPhase {
        self.phase.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl SafetyConfig for MemorySafetyConfig {
    async fn profit_threshold(
        &self,
        marketplace: Marketplace,
    ) -> Result<Option<ProfitThreshold>, SafetyInputError> {
        Ok(self
            .thresholds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&marketplace)
            .cloned())
    }

    async fn rollout_phase(&self) -> Result<RolloutPhase, SafetyInputError> {
        Ok(self.current_phase())
    }
}

#[async_trait]
impl ActiveTargets for crate::remote::MemoryMarketplace {
    async fn active_target_count(&self) -> Result<u64, SafetyInputError> {
        Ok(self.active_count())
    }

    async fn is_active(&self, target_id: &str) -> Result<bool, SafetyInputError> {
        Ok(self.listing(target_id).is_some_and(|listing| listing.active))
    }
}

#[derive(Default)]
pub struct MemoryPricingInputs {
    snapshots: RwLock<HashMap<String, TargetSnapshot>>,
    rates: RwLock<HashMap<(String, String), f64>>,
}

impl MemoryPricingInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_snapshot(&self, snapshot: TargetSnapshot) {
        self.snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(snapshot.target_id.clone(), snapshot);
    }

    /// Inserts `snapshot` unless its target already has one.
    pub fn insert_snapshot_if_absent(&self, snapshot: TargetSnapshot) -> bool {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if snapshots.contains_key(&snapshot.target_id) {
            return false;
        }
        snapshots.insert(snapshot.target_id.clone(), snapshot);
        true
    }

    pub fn set_rate(&self, from: &str, to: &str, rate: f64) {
        self.rates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((from.to_uppercase(), to.to_uppercase()), rate);
    }
}

#[async_trait]
impl PricingInputs for MemoryPricingInputs {
    async fn snapshot(&self, target_id: &str) -> Result<TargetSnapshot, SafetyInputError> {
        self.snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(target_id)
            .cloned()
            .ok_or_else(|| SafetyInputError::Missing(format!("snapshot for {target_id}")))
    }

    async fn exchange_rate(&self, from: &str, to: &str) -> Result<f64, SafetyInputError> {
        self.rates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(from.to_uppercase(), to.to_uppercase()))
            .copied()
            .ok_or_else(|| SafetyInputError::Missing(format!("exchange rate {from}->{to}")))
    }
}
