//! HTTP API for intents, offers, health checks and Prometheus metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use matcher_lib::{
    allocation::Coordinator,
    annotations::AnnotationParser,
    features::OfferVector,
    health::{ComponentStatus, HealthRegistry},
    observability::EngineMetrics,
    EngineError, EngineResult, IntentId, IntentSpec, IntentStatus, LatencyClass, Locality,
    MatchResult, OfferId, OfferSpec, Quantity,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub health_registry: HealthRegistry,
    pub metrics: EngineMetrics,
    pub annotations: AnnotationParser,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        health_registry: HealthRegistry,
        metrics: EngineMetrics,
        annotations: AnnotationParser,
    ) -> Self {
        Self {
            coordinator,
            health_registry,
            metrics,
            annotations,
        }
    }
}

/// Engine error mapped onto an HTTP status
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    /// The coordinator call did not complete (panicked or was cancelled)
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Engine(err) => {
                let status = match &err {
                    EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    EngineError::IntentNotFound(_) | EngineError::OfferNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    EngineError::DuplicateIntent(_) | EngineError::DuplicateOffer(_) => {
                        StatusCode::CONFLICT
                    }
                    EngineError::InsufficientSignal => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, err.to_string())
            }
            ApiError::Internal(message) => {
                warn!(error = %message, "Coordinator call failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a coordinator call on the blocking pool
///
/// Matching holds the intent's lock while the offer acceptor runs, and an
/// acceptor may wait on a remote provider; calls that take intent locks
/// must not run on a runtime worker.
async fn on_coordinator<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    F: FnOnce(&Coordinator) -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    let coordinator = state.coordinator.clone();
    tokio::task::spawn_blocking(move || call(&coordinator))
        .await
        .map_err(|e| ApiError::Internal(format!("coordinator task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// Intent submission body: an explicit intent, or workload annotations
/// from which one is derived
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IntentSubmission {
    Annotated {
        id: IntentId,
        annotations: BTreeMap<String, String>,
    },
    Explicit(IntentSpec),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub intent_id: IntentId,
    pub result: MatchResult,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawOfferResponse {
    pub offer_id: OfferId,
    pub displaced_intents: Vec<IntentId>,
}

/// Offer as reported by the API, with quantities in base units by kind
#[derive(Debug, Serialize, Deserialize)]
pub struct OfferView {
    pub offer_id: OfferId,
    pub locality: Locality,
    pub advertised: BTreeMap<String, u64>,
    pub remaining: BTreeMap<String, u64>,
    pub tags: BTreeSet<String>,
    pub cost_per_hour: f64,
    pub latency: LatencyClass,
    pub local: bool,
}

impl OfferView {
    fn new(coordinator: &Coordinator, offer: OfferVector) -> Self {
        let schema = coordinator.schema();
        Self {
            advertised: schema.describe(offer.advertised.as_slice()),
            remaining: schema.describe(offer.remaining.as_slice()),
            offer_id: offer.offer_id,
            locality: offer.locality,
            tags: offer.tags,
            cost_per_hour: offer.cost_per_hour,
            latency: offer.latency,
            local: offer.local,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still matching
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn submit_intent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IntentSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let spec = match body {
        IntentSubmission::Explicit(spec) => spec,
        IntentSubmission::Annotated { id, annotations } => {
            state.annotations.parse(&id, &annotations)?
        }
    };
    let intent_id = spec.id.clone();
    let result = on_coordinator(&state, move |coordinator| coordinator.submit(spec)).await?;

    Ok((StatusCode::CREATED, Json(SubmitResponse { intent_id, result })))
}

async fn get_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<IntentStatus>> {
    let status = on_coordinator(&state, move |coordinator| coordinator.intent_status(&id)).await?;
    Ok(Json(status))
}

async fn match_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubmitResponse>> {
    let intent_id = id.clone();
    let result = on_coordinator(&state, move |coordinator| coordinator.match_intent(&id)).await?;
    Ok(Json(SubmitResponse { intent_id, result }))
}

async fn withdraw_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    on_coordinator(&state, move |coordinator| coordinator.withdraw_intent(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_offers(State(state): State<Arc<AppState>>) -> Json<Vec<OfferView>> {
    let coordinator = &state.coordinator;
    Json(
        coordinator
            .offers()
            .into_iter()
            .map(|offer| OfferView::new(coordinator, offer))
            .collect(),
    )
}

async fn advertise_offer(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<OfferSpec>,
) -> ApiResult<(StatusCode, Json<OfferView>)> {
    let offer = state.coordinator.advertise(spec)?;
    Ok((
        StatusCode::CREATED,
        Json(OfferView::new(&state.coordinator, offer)),
    ))
}

async fn update_capacity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(delta): Json<BTreeMap<String, Quantity>>,
) -> ApiResult<Json<OfferView>> {
    let offer = state.coordinator.update_capacity(&id, &delta)?;
    Ok(Json(OfferView::new(&state.coordinator, offer)))
}

async fn withdraw_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WithdrawOfferResponse>> {
    let offer_id = id.clone();
    let displaced_intents =
        on_coordinator(&state, move |coordinator| coordinator.withdraw_offer(&id)).await?;
    Ok(Json(WithdrawOfferResponse {
        offer_id,
        displaced_intents,
    }))
}

async fn model(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let parameters = state.coordinator.parameters();
    Json(parameters.as_ref().clone())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/intents", post(submit_intent))
        .route("/v1/intents/:id", get(get_intent).delete(withdraw_intent))
        .route("/v1/intents/:id/match", post(match_intent))
        .route("/v1/offers", get(list_offers).post(advertise_offer))
        .route("/v1/offers/:id", axum::routing::delete(withdraw_offer))
        .route("/v1/offers/:id/capacity", patch(update_capacity))
        .route("/v1/model", get(model))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
