use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};

use crate::engine::{
    config::JudgerConfig,
    error::JudgeError,
    metrics::MetricsRegistry,
    models::{JudgeReport, JudgeRequest},
    queue::Scheduler,
};

const MAX_SOURCE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub judge_token: String,
    pub default_output_limit: u64,
    pub worker_count: usize,
    pub backend: &'static str,
}

impl ApiSettings {
    pub fn from_config(config: &JudgerConfig, backend: &'static str) -> Self {
        Self {
            judge_token: config.judge_token.clone(),
            default_output_limit: config.default_output_limit,
            worker_count: config.worker_count,
            backend,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    settings: Arc<ApiSettings>,
    scheduler: Scheduler,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(settings: ApiSettings, scheduler: Scheduler, metrics_registry: Arc<MetricsRegistry>) -> Router {
    let state = AppState {
        settings: Arc::new(settings),
        scheduler,
        metrics: metrics_registry,
    };
    Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .route("/judge", post(judge))
        .with_state(state)
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "workers": state.settings.worker_count,
        "backend": state.settings.backend,
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn judge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JudgeRequest>,
) -> Result<Json<JudgeReport>, JudgeError> {
    authenticate(&state.settings, &headers)?;
    if request.source.len() > MAX_SOURCE_BYTES {
        return Err(JudgeError::InvalidRequest("source too large".to_string()));
    }

    let job = request.into_job(state.settings.default_output_limit)?;
    tracing::debug!(job_id = %job.id, language = %job.language, "job accepted");

    let pending = state.scheduler.submit(job)?;
    let report = pending.await.map_err(|_| JudgeError::QueueClosed)??;
    Ok(Json(report))
}

fn authenticate(settings: &ApiSettings, headers: &HeaderMap) -> Result<(), JudgeError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(JudgeError::Unauthorized)?;
    if constant_time_eq(key.as_bytes(), settings.judge_token.as_bytes()) {
        Ok(())
    } else {
        Err(JudgeError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (l, r) in a.iter().zip(b.iter()) {
        out |= l ^ r;
    }
    out == 0
}
