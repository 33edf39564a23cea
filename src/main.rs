mod catalog;
mod config;
mod curation;
mod http;
mod jobs;
mod merge;
mod metrics;
mod models;
mod pipeline;
mod security;
mod upload;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use catalog::CatalogStore;
use config::{ServerConfig, split_list};
use futures::{Stream, StreamExt, stream};
use jobs::{JobInfo, UploadQueue};
use merge::{MergeEngine, MergeRules};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CatalogQuery, CatalogResponse, EnqueueResponse, ResultsResponse,
    SelectionsRequest, SelectionsResponse, StartRequest, StartResponse, UploadBatchRequest,
};
use pipeline::{
    PipelineError, PipelineErrorKind, PipelineRunner, PipelineSettings, StatusSnapshot,
    SubprocessCollector, clean_skus, snapshot_store_for,
};
use security::{AuthState, OperatorContext, require_api_auth};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use upload::UploadEngine;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ServerConfig::from_env();
    let collector = SubprocessCollector::from_env();
    info!(
        target = "catalog.api",
        work_dir = %config.work_dir.display(),
        collector = %collector.command_line(),
        "starting control surface"
    );
    let uploader = UploadEngine::from_env();
    if uploader.is_none() {
        warn!(
            target = "catalog.api",
            "Cloudinary credentials missing; uploads disabled"
        );
    }
    let runner = PipelineRunner::new(
        PipelineSettings::from_env(&config.work_dir),
        MergeEngine::new(MergeRules::from_env()),
        Arc::new(collector),
        uploader.clone(),
        snapshot_store_for(config.redis_url.as_deref(), &config.work_dir),
    );
    match runner.restore().await {
        Ok(Some(status)) => {
            info!(target = "catalog.api", status = ?status, "restored pipeline state")
        }
        Ok(None) => {}
        Err(err) => {
            warn!(target = "catalog.api", error = %err, "pipeline snapshot not restored")
        }
    }
    let queue = uploader.map(|engine| {
        UploadQueue::spawn(engine, runner.catalog().clone(), config.queue_capacity).0
    });

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;
    let state = AppState {
        runner,
        queue,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/pipeline",
            Router::new()
                .route("/start", post(start_pipeline))
                .route("/cancel", post(cancel_pipeline))
                .route("/status", get(pipeline_status))
                .route("/results", get(pipeline_results))
                .route("/stream", get(pipeline_stream))
                .route("/curation", post(submit_curation)),
        )
        .route("/catalog", get(get_catalog))
        .route("/catalog/selections", post(apply_catalog_selections))
        .route("/uploads", post(enqueue_uploads))
        .route("/uploads/{id}", get(get_upload_status))
        .route_layer(middleware::from_fn_with_state(
            AuthState::from_env(),
            require_api_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(config.request_max_bytes));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "catalog.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    runner: PipelineRunner,
    queue: Option<UploadQueue>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.runner.status().await;
    Json(json!({
        "status": "ok",
        "service": "sku-image-catalog",
        "pipeline": status.status,
        "uploads_enabled": state.queue.is_some(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Start a collection run.
///
/// - Method: `POST`
/// - Path: `/pipeline/start`
/// - Body: `StartRequest` (`skus` as a string or list, plus `upload` and
///   `require_review` flags)
/// - Errors: 400 for empty input, 409 while a run is active
async fn start_pipeline(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    crate::metrics::inc_requests("/pipeline/start");
    let run_id = state
        .runner
        .start(&payload.skus.into_vec(), payload.options)
        .await?;
    info!(
        target = "catalog.api",
        operator = %operator.operator_id,
        key_id = %operator.key_id,
        run_id = %run_id,
        "pipeline start accepted"
    );
    let total = state.runner.status().await.total;
    Ok(Json(StartResponse {
        run_id: run_id.to_string(),
        total,
    }))
}

async fn cancel_pipeline(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/pipeline/cancel");
    state.runner.cancel().await?;
    info!(
        target = "catalog.api",
        operator = %operator.operator_id,
        "pipeline cancel accepted"
    );
    Ok(Json(json!({ "status": "cancelling" })))
}

async fn pipeline_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    crate::metrics::inc_requests("/pipeline/status");
    Json(state.runner.status().await)
}

async fn pipeline_results(State(state): State<AppState>) -> Json<ResultsResponse> {
    crate::metrics::inc_requests("/pipeline/results");
    Json(ResultsResponse {
        results: state.runner.results().await,
    })
}

/// Server-sent events: everything emitted since the run started, then live
/// events until the client goes away.
///
/// - Method: `GET`
/// - Path: `/pipeline/stream`
/// - Events: `log` (plain text), `status` and `results` (JSON)
async fn pipeline_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    crate::metrics::inc_requests("/pipeline/stream");
    let subscription = state.runner.subscribe().await;
    let guard = FeedGuard {
        runner: state.runner.clone(),
        id: subscription.id,
    };
    let events = stream::iter(subscription.replay)
        .chain(UnboundedReceiverStream::new(subscription.receiver))
        .map(move |event| {
            let _feed = &guard;
            Ok(Event::default().event(event.name()).data(event.data()))
        });
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Drops the observer registration when the SSE response is dropped.
struct FeedGuard {
    runner: PipelineRunner,
    id: u64,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        let runner = self.runner.clone();
        let id = self.id;
        tokio::spawn(async move {
            runner.unsubscribe(id).await;
        });
    }
}

/// Release a run waiting for review; selections are SKU to kept URLs or
/// image positions, `null` drops the SKU.
async fn submit_curation(
    State(state): State<AppState>,
    Json(payload): Json<SelectionsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/pipeline/curation");
    let store = read_catalog(&state).await?;
    let selections = payload.resolve(&store);
    let count = selections.len();
    state.runner.submit_curation(selections).await?;
    Ok(Json(json!({ "accepted": count })))
}

async fn read_catalog(state: &AppState) -> Result<CatalogStore, PipelineError> {
    let catalog = state.runner.catalog().clone();
    tokio::task::spawn_blocking(move || catalog.read())
        .await
        .map_err(|err| PipelineError::internal("catalog", err.to_string()))?
        .map_err(|err| PipelineError::internal("catalog", err.to_string()))
}

async fn get_catalog(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<CatalogResponse>, AppError> {
    crate::metrics::inc_requests("/catalog");
    let store = read_catalog(&state).await?;
    let total_images = store.total_images();
    let records = match query.skus.as_deref().map(split_list) {
        Some(skus) if !skus.is_empty() => curation::review_entries(&store, &skus),
        _ => store.into_records(),
    };
    Ok(Json(CatalogResponse {
        records,
        total_images,
    }))
}

/// Standalone curation against the persisted catalog.
async fn apply_catalog_selections(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<SelectionsRequest>,
) -> Result<Json<SelectionsResponse>, AppError> {
    crate::metrics::inc_requests("/catalog/selections");
    let (outcome, skus) = state
        .runner
        .curate_catalog(move |store| payload.resolve(store))
        .await?;
    info!(
        target = "catalog.api",
        operator = %operator.operator_id,
        changed = outcome.changed,
        dropped = outcome.dropped,
        replaced = outcome.replaced,
        "catalog selections applied"
    );
    Ok(Json(SelectionsResponse { outcome, skus }))
}

async fn enqueue_uploads(
    State(state): State<AppState>,
    Json(payload): Json<UploadBatchRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/uploads");
    let Some(queue) = &state.queue else {
        return Err(
            PipelineError::invalid_input("uploads", "uploads are not configured").into(),
        );
    };
    let skus = payload
        .skus
        .map(|input| clean_skus(&input.into_vec()))
        .filter(|skus| !skus.is_empty());
    let id = queue
        .enqueue(skus)
        .await
        .map_err(|err| PipelineError::internal("enqueue", err.error))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_upload_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    crate::metrics::inc_requests("/uploads/{id}");
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(PipelineError::invalid_input("uploads", "invalid_job_id").into());
    };
    let info = match &state.queue {
        Some(queue) => queue.get(uuid).await,
        None => None,
    };
    info.map(Json)
        .ok_or_else(|| PipelineError::not_found("uploads", "not_found").into())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
