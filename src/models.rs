use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Ordered pipeline stages. `Done` is the terminal marker reached after publish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    Enrich,
    Validate,
    Price,
    Publish,
    Done,
}

impl Stage {
    /// Stage a rolled-back job is rewound to.
    pub const CHECKPOINT_BEFORE_PUBLISH: Stage = Stage::Price;

    pub const RUNNABLE: [Stage; 5] = [
        Stage::Scrape,
        Stage::Enrich,
        Stage::Validate,
        Stage::Price,
        Stage::Publish,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Scrape => Some(Stage::Enrich),
            Stage::Enrich => Some(Stage::Validate),
            Stage::Validate => Some(Stage::Price),
            Stage::Price => Some(Stage::Publish),
            Stage::Publish => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Enrich => "enrich",
            Stage::Validate => "validate",
            Stage::Price => "price",
            Stage::Publish => "publish",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    RetryScheduled,
    Failed,
    DeadLettered,
    Paused,
}

impl JobStatus {
    /// Statuses a worker may claim a delivered job from.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::RetryScheduled];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::DeadLettered
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::RetryScheduled => "RETRY_SCHEDULED",
            JobStatus::Failed => "FAILED",
            JobStatus::DeadLettered => "DEAD_LETTERED",
            JobStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer asked for. The kind decides where in the pipeline a job enters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scrape,
    Enrich,
    Publish,
    Reprice,
}

impl JobKind {
    pub fn entry_stage(self) -> Stage {
        match self {
            JobKind::Scrape => Stage::Scrape,
            JobKind::Enrich => Stage::Enrich,
            // publish requests still go through validation and pricing first
            JobKind::Publish => Stage::Validate,
            JobKind::Reprice => Stage::Price,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Veto,
    Orphaned,
    Compensation,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Veto => "veto",
            ErrorClass::Orphaned => "orphaned",
            ErrorClass::Compensation => "compensation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub class: ErrorClass,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(class: ErrorClass, stage: Stage, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            class,
            stage,
            message: message.into(),
            at,
        }
    }
}

/// A reversing action applied to a job during rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Compensation {
    pub stage: Stage,
    pub action: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub target_id: String,
    pub stage: Stage,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub compensations: Vec<Compensation>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        target_id: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target_id: target_id.into(),
            stage: kind.entry_stage(),
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            last_error: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
            compensations: Vec::new(),
            archived_at: None,
        }
    }

    /// False only for a RETRY_SCHEDULED job whose backoff has not elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status != JobStatus::RetryScheduled || self.next_run_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::enum_variant_names)]
pub enum Marketplace {
    EbayUs,
    #[serde(rename = "EBAY_GB", alias = "EBAY_UK")]
    EbayUk,
    EbayDe,
    Joom,
    Shopify,
}

impl Marketplace {
    pub fn code(&self) -> &'static str {
        match self {
            Marketplace::EbayUs => "EBAY_US",
            Marketplace::EbayUk => "EBAY_GB",
            Marketplace::EbayDe => "EBAY_DE",
            Marketplace::Joom => "JOOM",
            Marketplace::Shopify => "SHOPIFY",
        }
    }
}

impl FromStr for Marketplace {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "EBAY_US" | "EBAY" => Ok(Marketplace::EbayUs),
            "EBAY_GB" | "EBAY_UK" => Ok(Marketplace::EbayUk),
            "EBAY_DE" => Ok(Marketplace::EbayDe),
            "JOOM" => Ok(Marketplace::Joom),
            "SHOPIFY" => Ok(Marketplace::Shopify),
            other => Err(format!("unknown marketplace `{other}`")),
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Current canary stage. A set `halted_at` blocks every publish regardless of phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPhase {
    pub phase: u32,
    pub max_active_targets: u64,
    #[serde(default)]
    pub halted_at: Option<DateTime<Utc>>,
}

/// Per-marketplace profit guard. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfitThreshold {
    pub marketplace: Marketplace,
    pub min_profit_rate: f64,
    pub min_profit_amount: f64,
    pub alert_profit_rate: f64,
    pub is_active: bool,
    pub is_dry_run: bool,
}

/// What the safety gate needs to know about the target being published.
///
/// Prices: `sale_price` is in `sale_currency` on the destination marketplace;
/// `source_cost` is in `source_currency`. `fee_rate` is the marketplace fee as a
/// fraction of the sale price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetSnapshot {
    pub target_id: String,
    pub marketplace: Marketplace,
    pub title: String,
    #[serde(default)]
    pub title_en: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub sale_price: f64,
    pub sale_currency: String,
    pub source_cost: f64,
    pub source_currency: String,
    #[serde(default)]
    pub fee_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_only_move_forward() {
        let mut stage = Stage::Scrape;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(stage, Stage::Done);
        assert!(stage.is_terminal());
        assert_eq!(seen.len(), 6);
        assert!(Stage::CHECKPOINT_BEFORE_PUBLISH < Stage::Publish);
        assert_eq!(Stage::CHECKPOINT_BEFORE_PUBLISH.next(), Some(Stage::Publish));
    }

    #[test]
    fn job_kinds_enter_at_their_stage() {
        let now = Utc::now();
        let job = Job::new(JobKind::Publish, "product-1", 3, now);
        assert_eq!(job.stage, Stage::Validate);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(Job::new(JobKind::Reprice, "p", 3, now).stage, Stage::Price);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let value = serde_json::to_value(JobStatus::RetryScheduled).unwrap();
        assert_eq!(value, serde_json::json!("RETRY_SCHEDULED"));
        assert_eq!(JobStatus::DeadLettered.to_string(), "DEAD_LETTERED");
    }

    #[test]
    fn marketplace_parses_aliases() {
        assert_eq!("ebay_uk".parse::<Marketplace>(), Ok(Marketplace::EbayUk));
        assert_eq!(" joom ".parse::<Marketplace>(), Ok(Marketplace::Joom));
        assert!("amazon".parse::<Marketplace>().is_err());
    }
}
