//! The submission API (spec component C6): validates requests, enqueues jobs, and exposes
//! job-state/result lookup. Wire format is spec.md §6 exactly. Never blocks on execution —
//! submission returns as soon as the job is enqueued.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use coderunner_catalog::Catalog;
use coderunner_queue::{Job, JobQueue, JobState};
use serde::{Deserialize, Serialize};
use slog::{warn, Logger};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub queue: JobQueue,
    pub log: Logger,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(submit))
        .route("/results/:job_id", get(get_result))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitRequest {
    language: String,
    code: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

/// Validates a submission against spec.md §4.6 ("language ∈ catalog, code is non-empty
/// string"), independent of the queue, so the rule can be tested without a broker.
fn validate_submission(catalog: &Catalog, language: &str, code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("`code` must be a non-empty string".to_string());
    }
    if !catalog.contains(language) {
        return Err(format!("unknown language `{language}`"));
    }
    Ok(())
}

/// `POST /run` — spec.md §4.6's "Submit" and §6's wire table.
async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    if let Err(message) = validate_submission(&state.catalog, &req.language, &req.code) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    match state.queue.enqueue(&req.language, &req.code).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse { job_id: job_id.to_string() }),
        )
            .into_response(),
        Err(err) => {
            warn!(state.log, "failed to enqueue job"; "error" => %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue job")
        }
    }
}

#[derive(Serialize)]
struct ResultResponse {
    #[serde(rename = "jobId")]
    job_id: String,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    message: String,
}

impl ResultResponse {
    fn from_job(job: Job) -> Self {
        let message = match job.state {
            JobState::Waiting | JobState::Delayed => "job is queued".to_string(),
            JobState::Active => "job is running".to_string(),
            JobState::Stalled => "job's worker was lost; awaiting recovery".to_string(),
            JobState::Completed => "job completed".to_string(),
            JobState::Failed => "job failed".to_string(),
        };
        Self {
            job_id: job.id.to_string(),
            state: job.state,
            output: job.output,
            error: job.error,
            message,
        }
    }
}

/// `GET /results/:jobId` — spec.md §4.6's "Get result".
async fn get_result(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse() else {
        return error_response(StatusCode::NOT_FOUND, "unknown job id");
    };

    match state.queue.get(job_id).await {
        Ok(Some(job)) => Json(ResultResponse::from_job(job)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown job id"),
        Err(err) => {
            warn!(state.log, "failed to fetch job"; "job_id" => %job_id, "error" => %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to reach the queue broker")
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    server: &'static str,
    redis: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `GET /health` — spec.md §4.6's "Health", a round-trip ping to the broker.
async fn health(State(state): State<AppState>) -> Response {
    match state.queue.ping().await {
        Ok(()) => Json(HealthResponse { server: "OK", redis: "OK", error: None }).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HealthResponse {
                server: "OK",
                redis: "ERROR",
                error: Some(err.to_string()),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_code() {
        let catalog = Catalog::with_defaults();
        assert!(validate_submission(&catalog, "python", "   ").is_err());
    }

    #[test]
    fn rejects_unknown_language() {
        let catalog = Catalog::with_defaults();
        assert!(validate_submission(&catalog, "brainfuck", "+").is_err());
    }

    #[test]
    fn accepts_known_language_with_code() {
        let catalog = Catalog::with_defaults();
        assert!(validate_submission(&catalog, "python", "print(1)").is_ok());
    }

    #[test]
    fn result_response_carries_a_human_message_per_state() {
        let job = Job {
            id: coderunner_util::new_job_id(),
            language: "python".to_string(),
            code: "print(1)".to_string(),
            state: JobState::Completed,
            output: Some("1\n".to_string()),
            error: None,
            attempts: 1,
        };
        let response = ResultResponse::from_job(job);
        assert_eq!(response.message, "job completed");
        assert_eq!(response.output.as_deref(), Some("1\n"));
    }
}
