use crate::prelude::*;

use corvus_core::prelude::*;
use corvus_engine::analyzer::ScriptAnalysis;
use corvus_engine::engine::CancelAck;
use corvus_engine::log_hub::LogSubscription;
use corvus_engine::scheduler::PoolStats;
use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use tracing::error;

/// How long a finished log stream waits for the job to report its terminal status.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<EngineError>() {
            let status = match err {
                EngineError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
                EngineError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
                EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
                EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            };
            return (status, Json(ErrorBody::new(err.to_string()))).into_response();
        }

        if let Some(err) = self.0.downcast_ref::<AuthError>() {
            return match err {
                AuthError::Invalid | AuthError::Missing => {
                    (StatusCode::UNAUTHORIZED, Json(ErrorBody::new(err.to_string())))
                }
                AuthError::Forbidden(_) => {
                    (StatusCode::FORBIDDEN, Json(ErrorBody::new(err.to_string())))
                }
                AuthError::System(_) => {
                    error!("Internal Auth Provider Error: {:?}", self.0);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ErrorBody::new("Auth Error")),
                    )
                }
            }
            .into_response();
        }

        error!("Internal Server Error: {:?}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new("Internal Server Error")),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ErrorBody {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub result: CancelAck,
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub script: String,
}

#[derive(Serialize)]
pub struct AnalyzeResponse {
    pub analysis: ScriptAnalysis,
    pub gpu_available: bool,
}

#[derive(Serialize)]
pub struct MetricsSummaryResponse {
    pub jobs: Vec<(JobStatus, usize)>,
    pub pools: Vec<PoolStats>,
    pub shutting_down: bool,
    /// Absent when the configured metrics sink keeps no aggregates.
    pub completions: Option<MetricsSummary>,
}

/// One WebSocket frame of a log stream.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LogFrame {
    Chunk(LogChunk),
    Gap { missed: u64 },
    End { status: Option<JobStatus> },
}

impl From<LogEvent> for LogFrame {
    fn from(event: LogEvent) -> Self {
        match event {
            LogEvent::Chunk(chunk) => Self::Chunk(chunk),
            LogEvent::Gap { missed } => Self::Gap { missed },
        }
    }
}

/// Readable by its owner and by administrators. Others get `Forbidden`.
fn readable_job<S: CorvusServices, T: Scope>(
    state: &AppState<S>,
    caller: &ScopedUser<T>,
    id: JobId,
) -> Result<Job, ApiError> {
    let job = state.engine().status(id)?;
    if job.owner_id != caller.user.id && !caller.is_admin() {
        return Err(ApiError::from(EngineError::Forbidden(format!(
            "job {id} belongs to another owner"
        ))));
    }
    Ok(job)
}

/// GET /health
pub async fn health<S: CorvusServices>(State(state): State<AppState<S>>) -> Response {
    match state.engine().runtime_ready().await {
        Ok(()) => "OK".into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Sandbox runtime unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody::new(e.to_string())),
            )
                .into_response()
        }
    }
}

/// POST /jobs
pub async fn submit_job<S: CorvusServices>(
    State(state): State<AppState<S>>,
    ScopedUser { user, .. }: ScopedUser<JobSubmit>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.engine().submit(&user.id, request)?;
    let res = Json(SubmitResponse {
        job_id,
        status: JobStatus::Queued,
    });
    Ok((StatusCode::CREATED, res))
}

/// POST /jobs/analyze
pub async fn analyze_script<S: CorvusServices>(
    State(state): State<AppState<S>>,
    _: ScopedUser<JobSubmit>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine();
    Ok(Json(AnalyzeResponse {
        analysis: engine.analyze(&request.script),
        gpu_available: engine.config().gpu_slots > 0,
    }))
}

/// GET /jobs
pub async fn list_jobs<S: CorvusServices>(
    State(state): State<AppState<S>>,
    ScopedUser { user, .. }: ScopedUser<JobRead>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine().list_jobs(&user.id)))
}

/// GET /jobs/{id}
pub async fn get_job<S: CorvusServices>(
    State(state): State<AppState<S>>,
    caller: ScopedUser<JobRead>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let job = readable_job(&state, &caller, id)?;
    Ok(Json(job))
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job<S: CorvusServices>(
    State(state): State<AppState<S>>,
    caller: ScopedUser<JobCancel>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine();
    let result = if caller.is_admin() {
        engine.cancel_any(id)?
    } else {
        engine.cancel(id, &caller.user.id)?
    };
    Ok(Json(CancelResponse { job_id: id, result }))
}

/// GET /pools
pub async fn pools<S: CorvusServices>(
    State(state): State<AppState<S>>,
    _: ScopedUser<JobRead>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine().pool_stats()))
}

/// GET /metrics/summary
pub async fn metrics_summary<S: CorvusServices>(
    State(state): State<AppState<S>>,
    _: ScopedUser<JobRead>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine();
    Ok(Json(MetricsSummaryResponse {
        jobs: engine.counts(),
        pools: engine.pool_stats(),
        shutting_down: engine.is_shutting_down(),
        completions: engine.metrics().summary(),
    }))
}

/// GET /metrics/user
pub async fn user_metrics<S: CorvusServices>(
    State(state): State<AppState<S>>,
    ScopedUser { user, .. }: ScopedUser<JobRead>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine().owner_summary(&user.id)))
}

/// Handler: GET /jobs/{id}/logs
pub async fn stream_logs<S: CorvusServices>(
    State(state): State<AppState<S>>,
    caller: ScopedUser<JobRead>,
    Path(id): Path<JobId>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    readable_job(&state, &caller, id)?;
    let subscription = state.engine().stream_logs(id)?;
    let res = ws.on_upgrade(move |socket| handle_log_socket(state, id, subscription, socket));
    Ok(res)
}

async fn handle_log_socket<S: CorvusServices>(
    state: AppState<S>,
    id: JobId,
    mut subscription: LogSubscription,
    mut socket: WebSocket,
) {
    tracing::info!(job_id = %id, "Log subscriber attached");

    let finished = loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(event) => {
                        if !send_frame(&mut socket, &LogFrame::from(event)).await {
                            break false;
                        }
                    }
                    None => break true,
                }
            }
            client_msg = socket.recv() => {
                match client_msg {
                    Some(Ok(Message::Close(_))) => break false,
                    Some(Err(_)) | None => break false,
                    _ => {}
                }
            }
        }
    };

    if finished {
        let engine = state.engine();
        let status = settled_status(|| engine.status(id).ok().map(|job| job.status)).await;
        send_frame(&mut socket, &LogFrame::End { status }).await;
    }

    let _ = socket.send(Message::Close(None)).await;
    tracing::info!(job_id = %id, "Log subscriber detached");
}

/// The log channel closes just before the terminal status lands. Waits briefly for it.
async fn settled_status(read: impl Fn() -> Option<JobStatus>) -> Option<JobStatus> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        match read() {
            Some(status) if status.is_terminal() => return Some(status),
            None => return None,
            Some(_) if Instant::now() >= deadline => return None,
            Some(_) => sleep(SETTLE_INTERVAL).await,
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &LogFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            error!("Serialization error: {:?}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn settled_status_waits_for_terminal() {
        let reads = AtomicUsize::new(0);
        let status = settled_status(|| match reads.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Some(JobStatus::Running),
            _ => Some(JobStatus::Succeeded),
        })
        .await;

        assert_eq!(status, Some(JobStatus::Succeeded));
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_status_omits_a_status_that_never_settles() {
        let started = Instant::now();
        let status = settled_status(|| Some(JobStatus::Running)).await;

        assert_eq!(status, None);
        assert!(started.elapsed() >= SETTLE_TIMEOUT);
    }
}
