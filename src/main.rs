use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use eyre::{WrapErr, bail, eyre};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relist_pipeline::{
    config::PipelineSettings,
    jobs::{DispatchError, Dispatcher},
    models::{Job, JobKind, Marketplace, ProfitThreshold, TargetSnapshot},
    pipeline::{PublishGates, StageExecutor},
    queue::{MemoryQueue, QueueTransport, RedisQueue},
    recovery::{OperatorConfirmation, RecoveryController, RecoveryError},
    remote::{MemoryMarketplace, StageCalls},
    rollout::{PhaseStore, RolloutController, RolloutError, TransitionMode, default_plan},
    safety::{ActiveTargets, MemoryPricingInputs, MemorySafetyConfig, PricingInputs, SafetyConfig, SafetyGate},
    security::{Operator, OperatorAuth, require_operator},
    store::{JobStore, MemoryJobStore, StoreError},
    supabase::SupabaseClient,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "relist.worker", "worker crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let settings = PipelineSettings::load().wrap_err("loading pipeline settings")?;
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let backends = Backends::open(&settings)?;
    let queue = open_queue(&settings).await?;
    let calls = match &backends.marketplace {
        Some(marketplace) => StageCalls::demo(marketplace.clone()),
        None => StageCalls::http(&settings.stages, std::env::var("STAGE_API_KEY").ok())
            .map_err(|err| eyre!(err))?,
    };

    let policies = Arc::new(settings.stages.clone());
    let rollout = Arc::new(RolloutController::new());
    let executor = StageExecutor::new(
        calls.clone(),
        policies.clone(),
        PublishGates {
            gate: SafetyGate::new(settings.content.clone()),
            rollout: rollout.clone(),
            safety: backends.safety.clone(),
            pricing: backends.pricing.clone(),
            active: backends.active.clone(),
        },
    );
    let dispatcher = Dispatcher::new(
        backends.store.clone(),
        queue.clone(),
        executor,
        settings.workers.clone(),
    );
    let recovery = RecoveryController::new(
        backends.store.clone(),
        queue,
        calls,
        policies,
        settings.recovery.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = dispatcher.spawn(settings.workers.count, shutdown_rx.clone());
    let sweeper = recovery.spawn(shutdown_rx.clone());
    info!(
        target = "relist.worker",
        workers = settings.workers.count,
        demo = settings.demo,
        "pipeline started"
    );

    let state = AppState {
        dispatcher,
        recovery,
        rollout,
        phases: backends.phases,
        demo_listings: backends.demo_listings,
        prometheus_handle,
    };
    let operator_auth = OperatorAuth::from_env(settings.demo);

    let protected = Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/retry", post(retry_jobs))
        .route("/jobs/{id}/rollback", post(rollback_job))
        .route("/rollout", get(rollout_status))
        .route("/rollout/phase", post(change_phase))
        .route("/rollout/halt", post(halt_rollout))
        .route("/rollout/resume", post(resume_rollout))
        .route("/rollout/breaker/reset", post(reset_breaker))
        .route_layer(middleware::from_fn_with_state(operator_auth, require_operator));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/jobs/{id}", get(get_job))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = ([0, 0, 0, 0], settings.ops_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    info!(target = "relist.worker", "listening on {addr}");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.wrap_err("waiting for ctrl-c")?;
    info!(target = "relist.worker", "shutdown requested; letting in-flight stages finish");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(err) = worker.await {
            warn!(target = "relist.worker", error = %err, "worker task ended abnormally");
        }
    }
    if let Err(err) = sweeper.await {
        warn!(target = "relist.worker", error = %err, "recovery task ended abnormally");
    }
    server.await.wrap_err("joining ops server")?.wrap_err("ops server")?;
    info!(target = "relist.worker", "stopped");
    Ok(())
}

/// Store and safety inputs, opened once at startup.
struct Backends {
    store: Arc<dyn JobStore>,
    safety: Arc<dyn SafetyConfig>,
    phases: Arc<dyn PhaseStore>,
    pricing: Arc<dyn PricingInputs>,
    active: Arc<dyn ActiveTargets>,
    /// Present in demo mode, where publishing goes to an in-memory marketplace.
    marketplace: Option<Arc<MemoryMarketplace>>,
    /// Demo mode only: listing data seeded per submitted target.
    demo_listings: Option<Arc<MemoryPricingInputs>>,
}

impl Backends {
    fn open(settings: &PipelineSettings) -> eyre::Result<Self> {
        if !settings.demo {
            let Some(client) = SupabaseClient::from_env() else {
                bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required outside demo mode");
            };
            let client = Arc::new(client);
            return Ok(Self {
                store: client.clone(),
                safety: client.clone(),
                phases: client.clone(),
                pricing: client.clone(),
                active: client,
                marketplace: None,
                demo_listings: None,
            });
        }

        warn!(target = "relist.worker", "demo mode: in-memory store, marketplace and safety config");
        let first_phase = default_plan()
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("rollout plan is empty"))?;
        let safety = Arc::new(MemorySafetyConfig::new(first_phase));
        for marketplace in [
            Marketplace::EbayUs,
            Marketplace::EbayUk,
            Marketplace::EbayDe,
            Marketplace::Joom,
            Marketplace::Shopify,
        ] {
            safety.set_threshold(demo_threshold(marketplace));
        }
        let pricing = Arc::new(MemoryPricingInputs::new());
        pricing.set_rate("USD", "JPY", DEMO_USD_JPY);
        let marketplace = Arc::new(MemoryMarketplace::new());
        Ok(Self {
            store: Arc::new(MemoryJobStore::new()),
            safety: safety.clone(),
            phases: safety,
            pricing: pricing.clone(),
            active: marketplace.clone(),
            marketplace: Some(marketplace),
            demo_listings: Some(pricing),
        })
    }
}

const DEMO_USD_JPY: f64 = 150.0;

fn demo_threshold(marketplace: Marketplace) -> ProfitThreshold {
    ProfitThreshold {
        marketplace,
        min_profit_rate: 0.10,
        min_profit_amount: 3_000.0,
        alert_profit_rate: 0.15,
        is_active: true,
        is_dry_run: false,
    }
}

/// $200 sale of a ¥15,000 item with a 13% fee: about 37% margin.
fn demo_snapshot(target_id: &str) -> TargetSnapshot {
    TargetSnapshot {
        target_id: target_id.to_string(),
        marketplace: Marketplace::EbayUs,
        title: format!("Demo listing {target_id}"),
        title_en: None,
        brand: None,
        category: None,
        sale_price: 200.0,
        sale_currency: "USD".into(),
        source_cost: 15_000.0,
        source_currency: "JPY".into(),
        fee_rate: 0.13,
    }
}

async fn open_queue(settings: &PipelineSettings) -> eyre::Result<Arc<dyn QueueTransport>> {
    let queue = &settings.queue;
    match &queue.redis_url {
        Some(url) => {
            let redis = RedisQueue::connect(
                url,
                &queue.namespace,
                queue.visibility_timeout(),
                queue.poll_interval(),
            )
            .await
            .wrap_err("connecting to redis queue")?;
            info!(target = "relist.worker", namespace = %queue.namespace, "using redis queue");
            Ok(Arc::new(redis))
        }
        None => {
            warn!(target = "relist.worker", "REDIS_URL not set; using an in-process queue");
            Ok(Arc::new(MemoryQueue::new(queue.visibility_timeout())))
        }
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    recovery: RecoveryController,
    rollout: Arc<RolloutController>,
    phases: Arc<dyn PhaseStore>,
    demo_listings: Option<Arc<MemoryPricingInputs>>,
    prometheus_handle: PrometheusHandle,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "relist-worker",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>, AppError> {
    state
        .dispatcher
        .status(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", format!("job {id}")))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    kind: JobKind,
    target_id: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    if request.target_id.trim().is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "invalid_input", "target_id is empty"));
    }
    let target_id = request.target_id.trim();
    if let Some(listings) = &state.demo_listings
        && listings.insert_snapshot_if_absent(demo_snapshot(target_id))
    {
        info!(target = "relist.api", target_id = %target_id, "seeded demo listing");
    }
    let job = state.dispatcher.submit(request.kind, target_id).await?;
    info!(target = "relist.api", operator = %operator.name, job_id = %job.id, "job submitted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    reason: String,
}

async fn rollback_job(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<Uuid>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<Job>, AppError> {
    let reason = format!("{} (by {})", request.reason.trim(), operator.name);
    Ok(Json(state.recovery.rollback(id, &reason, Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    ids: Vec<Uuid>,
    /// Must equal `ids.len()`.
    confirm_count: usize,
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    requested: usize,
    retried: usize,
}

async fn retry_jobs(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, AppError> {
    let confirmation = OperatorConfirmation::new(operator.name, request.confirm_count);
    let retried = state
        .recovery
        .retry_failed_batch(&request.ids, &confirmation, Utc::now())
        .await?;
    Ok(Json(RetryResponse {
        requested: request.ids.len(),
        retried,
    }))
}

async fn rollout_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let phase = state
        .phases
        .rollout_phase()
        .await
        .map_err(RolloutError::from)?;
    let breaker = state.rollout.breaker_state();
    Ok(Json(json!({
        "phase": phase,
        "circuit_breaker_open": breaker.trip_reason().is_some(),
        "circuit_breaker_reason": breaker.trip_reason(),
        "publishes_in_flight": state.rollout.reserved_slots(),
    })))
}

#[derive(Debug, Deserialize)]
struct PhaseRequest {
    phase: u32,
    max_active_targets: u64,
    #[serde(default)]
    incident: bool,
}

async fn change_phase(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Json(request): Json<PhaseRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mode = if request.incident {
        TransitionMode::Incident
    } else {
        TransitionMode::Normal
    };
    let phase = state
        .rollout
        .transition(state.phases.as_ref(), request.phase, request.max_active_targets, mode)
        .await?;
    info!(target = "relist.api", operator = %operator.name, phase = phase.phase, "phase changed");
    Ok(Json(json!({ "phase": phase })))
}

#[derive(Debug, Deserialize)]
struct HaltRequest {
    #[serde(default)]
    rollback_published: bool,
    #[serde(default)]
    reason: Option<String>,
}

async fn halt_rollout(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Json(request): Json<HaltRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let now = Utc::now();
    let phase = state.rollout.halt(state.phases.as_ref(), now).await?;
    let rollback = if request.rollback_published {
        let reason = format!(
            "{} (halt by {})",
            request.reason.as_deref().unwrap_or("emergency halt"),
            operator.name
        );
        Some(state.recovery.rollback_all_published(&reason, now).await?)
    } else {
        None
    };
    Ok(Json(json!({ "phase": phase, "rollback": rollback })))
}

async fn resume_rollout(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let phase = state.rollout.resume(state.phases.as_ref()).await?;
    Ok(Json(json!({ "phase": phase })))
}

async fn reset_breaker(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
) -> StatusCode {
    info!(target = "relist.api", operator = %operator.name, "breaker reset requested");
    state.rollout.reset_breaker();
    StatusCode::NO_CONTENT
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        let (status, code) = match &value {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            StoreError::Conflict { .. } | StoreError::Invariant { .. } => (StatusCode::CONFLICT, "conflict"),
            StoreError::Backend(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        };
        Self::new(status, code, value.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Store(err) => err.into(),
            DispatchError::Queue(err) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", err.to_string())
            }
        }
    }
}

impl From<RecoveryError> for AppError {
    fn from(value: RecoveryError) -> Self {
        let detail = value.to_string();
        let (status, code) = match value {
            RecoveryError::Store(err) => return err.into(),
            RecoveryError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
            RecoveryError::NotRollbackable { .. } | RecoveryError::Busy(_) => {
                (StatusCode::CONFLICT, "conflict")
            }
            RecoveryError::Compensation { .. } => (StatusCode::BAD_GATEWAY, "compensation_failed"),
            RecoveryError::Unconfirmed(_) => (StatusCode::BAD_REQUEST, "unconfirmed"),
        };
        Self::new(status, code, detail)
    }
}

impl From<RolloutError> for AppError {
    fn from(value: RolloutError) -> Self {
        let status = match &value {
            RolloutError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, "rollout", value.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.code, "detail": self.detail });
        (self.status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
