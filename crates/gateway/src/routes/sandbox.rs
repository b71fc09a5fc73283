//! Batch code execution route.

use axum::{extract::State, http::StatusCode, Json};
use codecell_common::Error as CommonError;
use codecell_sandbox::{execute_batch, BatchDeadlines, BatchRequest, BatchResult, OrchestratorError};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

const MAX_CODE_CHARS: usize = 50_000;
const MAX_STDIN_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct RunCodeRequest {
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_code(
    State(state): State<AppState>,
    Json(body): Json<RunCodeRequest>,
) -> Result<Json<BatchResult>, (StatusCode, Json<ErrorResponse>)> {
    if body.code.chars().count() > MAX_CODE_CHARS {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ErrorResponse { error: format!("code exceeds {MAX_CODE_CHARS} code points") }),
        ));
    }
    if let Some(stdin) = &body.stdin {
        if stdin.chars().count() > MAX_STDIN_CHARS {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse { error: format!("stdin exceeds {MAX_STDIN_CHARS} code points") }),
            ));
        }
    }

    let request = BatchRequest { language: body.language, code: body.code, stdin: body.stdin };

    execute_batch(
        &state.queue,
        state.engine.clone(),
        state.registry.clone(),
        BatchDeadlines::default(),
        request,
    )
    .await
    .map(Json)
    .map_err(|e| {
        let common = to_common_error(e);
        (status_for(&common), Json(ErrorResponse { error: common.to_string() }))
    })
}

/// Narrows the orchestrator's error taxonomy down to the small shared
/// vocabulary every CodeCell adapter reports through, so the HTTP and
/// WebSocket boundaries stay consistent about what a caller actually sees.
fn to_common_error(e: OrchestratorError) -> CommonError {
    match e {
        OrchestratorError::Validation(msg) => CommonError::Validation(msg),
        other => CommonError::Sandbox(other.to_string()),
    }
}

fn status_for(e: &CommonError) -> StatusCode {
    match e {
        CommonError::Validation(_) => StatusCode::BAD_REQUEST,
        CommonError::NotFound(_) => StatusCode::NOT_FOUND,
        CommonError::Sandbox(_) | CommonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn list_languages(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.registry.list())
}
