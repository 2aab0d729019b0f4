//! Remote calls made by pipeline stages (scraper, translator, marketplace APIs).
//!
//! Implementations must be idempotent per `(target_id, stage)`: the queue may
//! deliver the same job twice, and the executor does not deduplicate.

use crate::config::StagePolicies;
use crate::http::build_client;
use crate::models::Stage;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("transient: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StageError::Permanent(message.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Identifier on the remote side, e.g. the marketplace listing id.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub output: Value,
}

#[async_trait]
pub trait StageCall: Send + Sync {
    async fn call(&self, target_id: &str, timeout: Duration) -> Result<StageResult, StageError>;

    /// Reverses the stage's external effect. Stages without one succeed trivially.
    async fn compensate(&self, _target_id: &str) -> Result<(), StageError> {
        Ok(())
    }
}

/// One remote call per runnable stage.
#[derive(Clone)]
pub struct StageCalls {
    pub scrape: Arc<dyn StageCall>,
    pub enrich: Arc<dyn StageCall>,
    pub validate: Arc<dyn StageCall>,
    pub price: Arc<dyn StageCall>,
    pub publish: Arc<dyn StageCall>,
}

impl StageCalls {
    pub fn for_stage(&self, stage: Stage) -> Option<&Arc<dyn StageCall>> {
        match stage {
            Stage::Scrape => Some(&self.scrape),
            Stage::Enrich => Some(&self.enrich),
            Stage::Validate => Some(&self.validate),
            Stage::Price => Some(&self.price),
            Stage::Publish => Some(&self.publish),
            Stage::Done => None,
        }
    }

    /// HTTP calls for every stage, using the endpoints from `policies`.
    pub fn http(policies: &StagePolicies, api_key: Option<String>) -> Result<Self, String> {
        let client = build_client();
        let make = |stage: Stage| -> Result<Arc<dyn StageCall>, String> {
            let endpoint = policies
                .for_stage(stage)
                .endpoint
                .clone()
                .ok_or_else(|| format!("no endpoint configured for stage {stage}"))?;
            Ok(Arc::new(HttpStageCall {
                http: client.clone(),
                stage,
                endpoint,
                api_key: api_key.clone(),
            }))
        };
        Ok(Self {
            scrape: make(Stage::Scrape)?,
            enrich: make(Stage::Enrich)?,
            validate: make(Stage::Validate)?,
            price: make(Stage::Price)?,
            publish: make(Stage::Publish)?,
        })
    }

    /// Accepting stages plus an in-memory marketplace for publish.
    pub fn demo(marketplace: Arc<MemoryMarketplace>) -> Self {
        Self {
            scrape: Arc::new(EchoStage(Stage::Scrape)),
            enrich: Arc::new(EchoStage(Stage::Enrich)),
            validate: Arc::new(EchoStage(Stage::Validate)),
            price: Arc::new(EchoStage(Stage::Price)),
            publish: marketplace,
        }
    }
}

/// Calls `POST {endpoint}` with the target id; `DELETE {endpoint}/{target_id}`
/// compensates. The `Idempotency-Key` header carries `{target_id}:{stage}`.
pub struct HttpStageCall {
    http: Client,
    stage: Stage,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpStageCall {
    fn idempotency_key(&self, target_id: &str) -> String {
        format!("{target_id}:{}", self.stage)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl StageCall for HttpStageCall {
    async fn call(&self, target_id: &str, timeout: Duration) -> Result<StageResult, StageError> {
        let request = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .header("Idempotency-Key", self.idempotency_key(target_id))
            .json(&json!({ "target_id": target_id, "stage": self.stage }));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(StageResult::default());
        }
        response
            .json::<StageResult>()
            .await
            .map_err(|err| StageError::permanent(format!("invalid {} response: {err}", self.stage)))
    }

    async fn compensate(&self, target_id: &str) -> Result<(), StageError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), target_id);
        let request = self
            .http
            .delete(url)
            .header("Idempotency-Key", format!("{}:undo", self.idempotency_key(target_id)));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        let status = response.status();
        // already gone counts as undone
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        Err(classify_status(status, retry_after, ""))
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is final.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> StageError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StageError::Transient {
            message: detail,
            retry_after,
        }
    } else {
        StageError::Permanent(detail)
    }
}

fn classify_transport(err: &reqwest::Error) -> StageError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StageError::transient(err.to_string())
    } else {
        StageError::permanent(err.to_string())
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Accepts every call. Stands in for scrape/enrich/validate/price in demo mode.
pub struct EchoStage(pub Stage);

#[async_trait]
impl StageCall for EchoStage {
    async fn call(&self, target_id: &str, _timeout: Duration) -> Result<StageResult, StageError> {
        Ok(StageResult {
            external_id: None,
            output: json!({ "target_id": target_id, "stage": self.0 }),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceListing {
    pub listing_id: String,
    pub active: bool,
    pub publish_calls: u32,
}

/// Destination marketplace kept in memory. Publishing upserts by target id,
/// so repeated publishes of one target keep a single listing.
#[derive(Default)]
pub struct MemoryMarketplace {
    listings: Mutex<HashMap<String, MarketplaceListing>>,
}

impl MemoryMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> u64 {
        self.lock().values().filter(|listing| listing.active).count() as u64
    }

    pub fn listing(&self, target_id: &str) -> Option<MarketplaceListing> {
        self.lock().get(target_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MarketplaceListing>> {
        self.listings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StageCall for MemoryMarketplace {
    async fn call(&self, target_id: &str, _timeout: Duration) -> Result<StageResult, StageError> {
        let mut listings = self.lock();
        let count = listings.len();
        let listing = listings
            .entry(target_id.to_string())
            .or_insert_with(|| MarketplaceListing {
                listing_id: format!("LST-{:06}", count + 1),
                active: false,
                publish_calls: 0,
            });
        listing.active = true;
        listing.publish_calls += 1;
        Ok(StageResult {
            external_id: Some(listing.listing_id.clone()),
            output: json!({ "listing_id": listing.listing_id }),
        })
    }

    async fn compensate(&self, target_id: &str) -> Result<(), StageError> {
        if let Some(listing) = self.lock().get_mut(target_id) {
            listing.active = false;
        }
        Ok(())
    }
}
