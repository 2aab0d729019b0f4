//! API-key check for the operator endpoints (rollback, bulk retry, rollout).

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{collections::HashMap, env, sync::Arc};
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct OperatorAuth {
    /// Presented key to operator name.
    keys: Arc<HashMap<String, String>>,
}

/// Authenticated operator, inserted as a request extension.
#[derive(Clone, Debug, PartialEq)]
pub struct Operator {
    pub name: String,
}

impl OperatorAuth {
    /// Reads `OPS_API_KEYS` as `name:key` pairs separated by commas. Demo mode
    /// falls back to `demo:demo-key` when nothing is configured.
    pub fn from_env(demo: bool) -> Self {
        let raw = env::var("OPS_API_KEYS").unwrap_or_default();
        let auth = Self::parse(&raw);
        if !auth.keys.is_empty() {
            info!(target = "relist.api", key_count = auth.keys.len(), "loaded operator keys");
            return auth;
        }
        if demo {
            warn!(target = "relist.api", "OPS_API_KEYS empty; using demo operator key");
            return Self::parse("demo:demo-key");
        }
        warn!(target = "relist.api", "OPS_API_KEYS empty; operator endpoints will reject every call");
        auth
    }

    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once(':') {
                Some((name, key)) if !name.trim().is_empty() && !key.trim().is_empty() => {
                    keys.insert(key.trim().to_string(), name.trim().to_string());
                }
                _ => warn!(target = "relist.api", "ignored malformed OPS_API_KEYS entry"),
            }
        }
        Self { keys: Arc::new(keys) }
    }

    fn authenticate(&self, presented: &str) -> Option<Operator> {
        self.keys.get(presented).map(|name| Operator { name: name.clone() })
    }
}

pub async fn require_operator(
    State(auth): State<OperatorAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(presented) = extract_api_key(request.headers()) else {
        return unauthorized("missing_api_key", "Provide X-Ops-Key or a Bearer token");
    };
    let Some(operator) = auth.authenticate(&presented) else {
        return unauthorized("invalid_api_key", "Key not recognized");
    };
    request.extensions_mut().insert(operator);
    next.run(request).await
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Ops-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": code, "detail": message })),
    )
        .into_response()
}
