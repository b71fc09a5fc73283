//! Orchestrator error taxonomy.
//!
//! One variant per error kind in the design's error table; each variant
//! documents the caller-visible effect so adapters (batch HTTP response,
//! interactive WS message) can map it without re-deriving policy.

use thiserror::Error;

/// Errors the orchestrator itself recognizes, as distinct from a nonzero
/// exit code or stderr output produced by the sandboxed program (those are
/// not orchestrator errors — they are a successful orchestration).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Unknown language, missing fields, or oversized payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Ephemeral image build failed (batch only).
    #[error("image build failed: {0}")]
    BuildFailed(String),

    /// Container create/attach/start failed.
    #[error("sandbox start failed: {0}")]
    SandboxStartFailed(String),

    /// The framed stream ended mid-header or mid-payload.
    #[error("truncated frame in sandbox stream")]
    TruncatedFrame,

    /// The execution's deadline elapsed before the sandbox exited on its own.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Caller disconnected or explicitly cancelled an interactive execution.
    #[error("execution cancelled")]
    Cancelled,

    /// A cleanup step (remove container/image, delete work dir) failed.
    /// Always logged, never surfaced to a caller.
    #[error("cleanup error: {0}")]
    CleanupError(String),
}

impl OrchestratorError {
    /// Whether this error kind can appear in the response to a *batch*
    /// caller as a 500 rather than a successful (possibly nonzero-exit)
    /// result. `CleanupError` never reaches a caller.
    pub fn is_caller_visible(&self) -> bool {
        !matches!(self, OrchestratorError::CleanupError(_))
    }
}
