//! Supabase (PostgREST) backing for the job store, the safety configuration
//! and the pricing inputs.
//!
//! Tables: `pipeline_jobs`, `profit_thresholds`, `rollout_phase` (single row,
//! `id = 1`), `listings`, `publish_candidates`, `exchange_rates`.

use crate::http::build_client;
use crate::models::{Job, JobStatus, Marketplace, ProfitThreshold, RolloutPhase, TargetSnapshot};
use crate::rollout::PhaseStore;
use crate::safety::{ActiveTargets, PricingInputs, SafetyConfig, SafetyInputError};
use crate::store::{JobFilter, JobPatch, JobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, header::CONTENT_RANGE};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

const JOBS: &str = "pipeline_jobs";
const THRESHOLDS: &str = "profit_thresholds";
const ROLLOUT: &str = "rollout_phase";
const LISTINGS: &str = "listings";
const CANDIDATES: &str = "publish_candidates";
const RATES: &str = "exchange_rates";

type Params = Vec<(&'static str, String)>;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl From<SupabaseError> for StoreError {
    fn from(value: SupabaseError) -> Self {
        StoreError::Backend(value.to_string())
    }
}

impl From<SupabaseError> for SafetyInputError {
    fn from(value: SupabaseError) -> Self {
        SafetyInputError::Unavailable(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RateRow {
    rate: f64,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key))
    }

    pub fn new(base_url: &str, service_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        }
    }

    fn request(&self, method: Method, table: &str, params: &Params) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .query(params)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(request: RequestBuilder) -> Result<Response, SupabaseError> {
        let response = request
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SupabaseError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn rows<T: DeserializeOwned>(request: RequestBuilder) -> Result<Vec<T>, SupabaseError> {
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    async fn fetch_phase(&self) -> Result<Option<RolloutPhase>, SupabaseError> {
        let params = vec![
            ("id", "eq.1".to_string()),
            ("select", "phase,max_active_targets,halted_at".to_string()),
        ];
        let mut rows: Vec<RolloutPhase> = Self::rows(self.request(Method::GET, ROLLOUT, &params)).await?;
        Ok(rows.pop())
    }
}

#[async_trait]
impl JobStore for SupabaseClient {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let request = self
            .request(Method::POST, JOBS, &Vec::new())
            .header("Prefer", "return=representation")
            .json(&job);
        let mut rows: Vec<Job> = Self::rows(request).await?;
        rows.pop()
            .ok_or_else(|| StoreError::Backend(format!("insert of job {} returned no row", job.id)))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let params = vec![
            ("id", format!("eq.{id}")),
            ("select", "*".to_string()),
            ("limit", "1".to_string()),
        ];
        let mut rows: Vec<Job> = Self::rows(self.request(Method::GET, JOBS, &params)).await?;
        Ok(rows.pop())
    }

    async fn claim(
        &self,
        id: Uuid,
        from: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        // single conditional UPDATE; zero rows back means someone else won
        // or the retry is not due yet
        let request = self
            .request(Method::PATCH, JOBS, &claim_params(id, from, now))
            .header("Prefer", "return=representation")
            .json(&json!({ "status": JobStatus::Running, "updated_at": timestamp(now) }));
        let mut rows: Vec<Job> = Self::rows(request).await?;
        Ok(rows.pop())
    }

    async fn update(
        &self,
        id: Uuid,
        patch: JobPatch,
        expected: JobStatus,
    ) -> Result<Job, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        if current.status != expected || current.archived_at.is_some() {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: current.status,
            });
        }
        // validate record invariants before writing
        patch.apply_to(&mut current.clone())?;

        let params = vec![
            ("id", format!("eq.{id}")),
            ("status", format!("eq.{}", expected.as_str())),
            ("updated_at", format!("eq.{}", timestamp(current.updated_at))),
            ("archived_at", "is.null".to_string()),
        ];
        let request = self
            .request(Method::PATCH, JOBS, &params)
            .header("Prefer", "return=representation")
            .json(&patch);
        let mut rows: Vec<Job> = Self::rows(request).await?;
        if let Some(job) = rows.pop() {
            return Ok(job);
        }
        let actual = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        Err(StoreError::Conflict {
            id,
            expected,
            actual: actual.status,
        })
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(Self::rows(self.request(Method::GET, JOBS, &filter_params(filter))).await?)
    }

    async fn archive(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let params = vec![
            ("id", format!("eq.{id}")),
            ("status", status_in(&[JobStatus::Succeeded, JobStatus::DeadLettered])),
            ("archived_at", "is.null".to_string()),
        ];
        let request = self
            .request(Method::PATCH, JOBS, &params)
            .header("Prefer", "return=representation")
            .json(&json!({ "archived_at": timestamp(now) }));
        let rows: Vec<Job> = Self::rows(request).await?;
        if !rows.is_empty() {
            return Ok(());
        }
        match self.get(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(job) if job.archived_at.is_some() => Ok(()),
            Some(job) => Err(StoreError::Invariant {
                id,
                message: format!("cannot archive a {} job", job.status),
            }),
        }
    }
}

#[async_trait]
impl SafetyConfig for SupabaseClient {
    async fn profit_threshold(
        &self,
        marketplace: Marketplace,
    ) -> Result<Option<ProfitThreshold>, SafetyInputError> {
        let params = vec![
            ("marketplace", format!("eq.{}", marketplace.code())),
            ("select", "*".to_string()),
            ("limit", "1".to_string()),
        ];
        let mut rows: Vec<ProfitThreshold> =
            Self::rows(self.request(Method::GET, THRESHOLDS, &params)).await?;
        Ok(rows.pop())
    }

    async fn rollout_phase(&self) -> Result<RolloutPhase, SafetyInputError> {
        self.fetch_phase()
            .await?
            .ok_or_else(|| SafetyInputError::Missing("rollout phase row".into()))
    }
}

#[async_trait]
impl PhaseStore for SupabaseClient {
    async fn write_phase(&self, phase: &RolloutPhase) -> Result<(), SafetyInputError> {
        let params = vec![("id", "eq.1".to_string())];
        let request = self
            .request(Method::PATCH, ROLLOUT, &params)
            .header("Prefer", "return=minimal")
            .json(phase);
        Self::send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl ActiveTargets for SupabaseClient {
    async fn active_target_count(&self) -> Result<u64, SafetyInputError> {
        let params = vec![
            ("status", "eq.ACTIVE".to_string()),
            ("select", "target_id".to_string()),
        ];
        let response = Self::send(
            self.request(Method::GET, LISTINGS, &params)
                .header("Prefer", "count=exact")
                .header("Range-Unit", "items")
                .header("Range", "0-0"),
        )
        .await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| SafetyInputError::Invalid("listings count without Content-Range total".into()))
    }

    async fn is_active(&self, target_id: &str) -> Result<bool, SafetyInputError> {
        let params = vec![
            ("target_id", format!("eq.{target_id}")),
            ("status", "eq.ACTIVE".to_string()),
            ("select", "target_id".to_string()),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<serde_json::Value> =
            Self::rows(self.request(Method::GET, LISTINGS, &params)).await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl PricingInputs for SupabaseClient {
    async fn snapshot(&self, target_id: &str) -> Result<TargetSnapshot, SafetyInputError> {
        let params = vec![
            ("target_id", format!("eq.{target_id}")),
            ("select", "*".to_string()),
            ("limit", "1".to_string()),
        ];
        let mut rows: Vec<TargetSnapshot> =
            Self::rows(self.request(Method::GET, CANDIDATES, &params)).await?;
        rows.pop()
            .ok_or_else(|| SafetyInputError::Missing(format!("publish candidate {target_id}")))
    }

    async fn exchange_rate(&self, from: &str, to: &str) -> Result<f64, SafetyInputError> {
        let params = vec![
            ("base_currency", format!("eq.{}", from.to_uppercase())),
            ("quote_currency", format!("eq.{}", to.to_uppercase())),
            ("select", "rate".to_string()),
            ("order", "fetched_at.desc".to_string()),
            ("limit", "1".to_string()),
        ];
        let mut rows: Vec<RateRow> = Self::rows(self.request(Method::GET, RATES, &params)).await?;
        rows.pop()
            .map(|row| row.rate)
            .ok_or_else(|| SafetyInputError::Missing(format!("exchange rate {from}->{to}")))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_in(statuses: &[JobStatus]) -> String {
    let list = statuses
        .iter()
        .map(|status| status.as_str())
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({list})")
}

/// A RETRY_SCHEDULED row only matches once its `next_run_at` has passed.
fn claim_params(id: Uuid, from: &[JobStatus], now: DateTime<Utc>) -> Params {
    let mut params = vec![
        ("id", format!("eq.{id}")),
        ("archived_at", "is.null".to_string()),
    ];
    let (retry, other): (Vec<JobStatus>, Vec<JobStatus>) = from
        .iter()
        .copied()
        .partition(|status| *status == JobStatus::RetryScheduled);
    if retry.is_empty() {
        params.push(("status", status_in(from)));
        return params;
    }
    let due = format!(
        "and(status.eq.{},or(next_run_at.is.null,next_run_at.lte.\"{}\"))",
        JobStatus::RetryScheduled.as_str(),
        timestamp(now)
    );
    let clause = if other.is_empty() {
        due
    } else {
        format!("status.{},{due}", status_in(&other))
    };
    params.push(("or", format!("({clause})")));
    params
}

fn filter_params(filter: &JobFilter) -> Params {
    let mut params = vec![
        ("select", "*".to_string()),
        ("archived_at", "is.null".to_string()),
        ("order", "updated_at.asc".to_string()),
    ];
    if !filter.statuses.is_empty() {
        params.push(("status", status_in(&filter.statuses)));
    }
    if let Some(before) = filter.updated_before {
        params.push(("updated_at", format!("lt.{}", timestamp(before))));
    }
    if let Some(due) = filter.due_by {
        params.push(("next_run_at", format!("lte.{}", timestamp(due))));
    }
    if let Some(limit) = filter.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

/// Total from a PostgREST `Content-Range` header such as `0-0/42` or `*/0`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filters_translate_to_postgrest_operators() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let filter = JobFilter::statuses(&[JobStatus::Pending, JobStatus::RetryScheduled])
            .updated_before(at)
            .due_by(at)
            .limit(50);
        let params = filter_params(&filter);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("status"), Some("in.(PENDING,RETRY_SCHEDULED)"));
        assert_eq!(get("updated_at"), Some("lt.2025-03-01T12:00:00.000000Z"));
        assert_eq!(get("next_run_at"), Some("lte.2025-03-01T12:00:00.000000Z"));
        assert_eq!(get("archived_at"), Some("is.null"));
        assert_eq!(get("limit"), Some("50"));
    }

    #[test]
    fn claim_waits_for_retry_backoff() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let id = Uuid::nil();
        let params = claim_params(id, &JobStatus::CLAIMABLE, at);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("status"), None);
        assert_eq!(
            get("or"),
            Some(
                "(status.in.(PENDING),and(status.eq.RETRY_SCHEDULED,\
                 or(next_run_at.is.null,next_run_at.lte.\"2025-03-01T12:00:00.000000Z\")))"
            )
        );

        let pending_only = claim_params(id, &[JobStatus::Pending], at);
        assert!(pending_only.contains(&("status", "in.(PENDING)".to_string())));
        assert!(pending_only.iter().all(|(k, _)| *k != "or"));
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(content_range_total("0-0/42"), Some(42));
        assert_eq!(content_range_total("*/0"), Some(0));
        assert_eq!(content_range_total("0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn patch_serialises_cleared_fields_as_null() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let patch = JobPatch::new(now)
            .status(JobStatus::Pending)
            .last_error(None)
            .next_run_at(None);
        let body = serde_json::to_value(&patch).unwrap();
        assert_eq!(body["status"], "PENDING");
        assert!(body["last_error"].is_null());
        assert!(body.as_object().unwrap().contains_key("next_run_at"));
        assert!(!body.as_object().unwrap().contains_key("stage"));
        assert!(!body.as_object().unwrap().contains_key("rewind"));
    }
}
