// HTTP route handlers for the Verifix API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use verifix_common::types::{ExecutionRequest, ExecutionResult, Language, VerificationResult};
use verifix_engine::{validate_request, RunLimits};

use crate::AppState;

/// Error response carried as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Parse and validate a request body. Shape errors are 400s.
fn accept(payload: Result<Json<ExecutionRequest>, JsonRejection>) -> Result<ExecutionRequest, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    validate_request(&request).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(request)
}

/// POST /verify - Run the full verification loop
pub async fn verify(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Json<VerificationResult>, ApiError> {
    let request = accept(payload)?;
    let verifier = state.verifier.clone();

    // Own task so a panic inside one verification only fails this request.
    let record = tokio::spawn(async move { verifier.verify(&request).await })
        .await
        .map_err(|e| {
            error!(error = %e, "Verification task failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "verification task failed")
        })?;

    info!(
        verification_id = %record.id,
        status = ?record.final_status,
        attempts = record.attempts,
        "Verification served"
    );
    Ok(Json(record))
}

/// POST /execute - One sandboxed run, scored against any supplied test cases, no regeneration
pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let request = accept(payload)?;
    let verifier = state.verifier.clone();

    let result = tokio::spawn(async move {
        let limits = RunLimits::for_request(verifier.config(), &request);
        let mut result = verifier
            .executor()
            .execute(&request.code, request.language, limits, &request.dependencies)
            .await;

        if let Some(cases) = request.test_cases.as_deref().filter(|c| !c.is_empty()) {
            if result.success {
                let test_results = verifier
                    .runner()
                    .run_tests(
                        &request.code,
                        cases,
                        request.language,
                        request.entry_point.as_deref(),
                        limits,
                        &request.dependencies,
                    )
                    .await;
                result.apply_test_results(test_results);
            }
        }
        result
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Execution task failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "execution task failed")
    })?;

    Ok(Json(result))
}

/// GET /results/:id - Fetch a persisted verification record
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VerificationResult>, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid verification ID format"))?;

    match state.store.load(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No verification result for {}", id),
        )),
        Err(e) => {
            warn!(verification_id = %id, error = %e, "Result store lookup failed");
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Result store unavailable"))
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /languages - Supported language names
pub async fn list_languages() -> impl IntoResponse {
    let names: Vec<&str> = Language::ALL.iter().map(|l| l.as_str()).collect();
    Json(json!({ "languages": names }))
}
