//! One-shot batch execution.
//!
//! Materializes a work directory, writes the source (and `input.txt` when
//! stdin was supplied and the language's stdin detector matches), runs it to
//! completion or deadline, and returns a single combined result. Cleanup
//! runs on every exit path.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::demux::concat_payloads;
use crate::driver::{ContainerOpts, SandboxEngine};
use crate::error::OrchestratorError;
use crate::limits::{BatchDeadlines, ResourceLimits, STOP_GRACE};
use crate::queue::AdmissionQueue;
use crate::registry::Registry;
use crate::state::{Execution, ExecutionId, ExecutionMode, ExecutionState};

const MAX_CODE_CHARS: usize = 50_000;
const MAX_STDIN_CHARS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    #[serde(rename = "executionId")]
    pub id: ExecutionId,
    pub status: Status,
    pub output: String,
    pub exit_code: i64,
}

fn validate(request: &BatchRequest, registry: &Registry) -> Result<(), OrchestratorError> {
    if request.code.chars().count() > MAX_CODE_CHARS {
        return Err(OrchestratorError::Validation(format!(
            "code exceeds {MAX_CODE_CHARS} code points"
        )));
    }
    if let Some(stdin) = &request.stdin {
        if stdin.chars().count() > MAX_STDIN_CHARS {
            return Err(OrchestratorError::Validation(format!(
                "stdin exceeds {MAX_STDIN_CHARS} code points"
            )));
        }
    }
    registry
        .lookup(&request.language)
        .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
    Ok(())
}

/// Build the container's command line. Stdin is always fed from a file
/// written into the container (`input.txt`), never from a live attach, so
/// batch executions never need `open_stdin` on the container itself.
pub(crate) fn build_cmd(
    run_command: &[String],
    compile_run_command: Option<&str>,
    stdin_path: Option<&str>,
) -> Vec<String> {
    let run_part = match compile_run_command {
        Some(compile) => format!("{compile} && {}", run_command.join(" ")),
        None => run_command.join(" "),
    };

    match stdin_path {
        Some(path) => vec!["sh".to_string(), "-c".to_string(), format!("cat {path} | ( {run_part} )")],
        None if compile_run_command.is_some() => vec!["sh".to_string(), "-c".to_string(), run_part],
        None => run_command.to_vec(),
    }
}

/// Validate, admit, and run one batch execution, awaiting its result. The
/// wait here is exactly the "time spent in admitted" the queue uses for
/// backpressure: `enqueue` itself never blocks.
pub async fn execute_batch(
    queue: &AdmissionQueue,
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<Registry>,
    deadlines: BatchDeadlines,
    request: BatchRequest,
) -> Result<BatchResult, OrchestratorError> {
    validate(&request, &registry)?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.enqueue(async move {
        let result = run_one(engine, registry, deadlines, request).await;
        let _ = tx.send(result);
    });

    rx.await
        .map_err(|_| OrchestratorError::SandboxStartFailed("dispatcher dropped the task".into()))?
}

async fn run_one(
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<Registry>,
    deadlines: BatchDeadlines,
    request: BatchRequest,
) -> Result<BatchResult, OrchestratorError> {
    let spec = registry
        .lookup(&request.language)
        .map_err(|e| OrchestratorError::Validation(e.to_string()))?
        .clone();

    let stdin_detected = request.stdin.is_some() && spec.detects_stdin(&request.code);
    let deadline = if stdin_detected { deadlines.stdin_detected } else { deadlines.plain };

    let work_dir: PathBuf = std::env::temp_dir().join(format!("codecell-batch-{}", uuid::Uuid::new_v4()));
    let mut execution = Execution::new(ExecutionMode::Batch, work_dir.clone(), deadline);
    info!(execution_id = %execution.id, language = %spec.tag, "batch execution admitted");

    let outcome = run_execution(&mut execution, &*engine, &spec, &request, stdin_detected).await;
    execution.cleanup(&*engine).await;

    match outcome {
        Ok((frames, exit_code)) => {
            let combined = concat_payloads(&frames);
            let output = String::from_utf8_lossy(&combined).into_owned();
            Ok(BatchResult {
                id: execution.id,
                status: if exit_code == 0 { Status::Success } else { Status::Error },
                output,
                exit_code,
            })
        }
        Err(e) => Err(e),
    }
}

async fn run_execution(
    execution: &mut Execution,
    engine: &dyn SandboxEngine,
    spec: &crate::registry::LanguageSpec,
    request: &BatchRequest,
    stdin_detected: bool,
) -> Result<(Vec<crate::demux::Frame>, i64), OrchestratorError> {
    execution.enter(ExecutionState::Preparing);
    tokio::fs::create_dir_all(&execution.work_dir)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(format!("work dir: {e}")))?;
    execution.note_workdir_acquired();

    let mut stdin_contents = None;
    if stdin_detected {
        let mut text = request.stdin.clone().unwrap_or_default();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        stdin_contents = Some(text);
    }

    execution.enter(ExecutionState::Building);
    let stdin_container_path = stdin_contents.as_ref().map(|_| "/code/input.txt".to_string());
    let cmd = build_cmd(
        &spec.run_command,
        spec.compile_run_command.as_deref(),
        stdin_container_path.as_deref(),
    );

    let limits = ResourceLimits::for_memory_class(spec.memory_class);
    let opts = ContainerOpts {
        limits,
        open_stdin: false,
        working_dir: "/code".to_string(),
        bind_mount: None,
    };

    let container = engine
        .create_container(spec.image, cmd, &opts)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;
    execution.note_container_acquired(container.clone());

    let source_path = format!("/code/{}", spec.source_filename);
    engine
        .write_file(&container, &source_path, request.code.as_bytes())
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;
    if let Some(contents) = &stdin_contents {
        engine
            .write_file(&container, "/code/input.txt", contents.as_bytes())
            .await
            .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;
    }

    execution.enter(ExecutionState::Starting);
    let attached = engine
        .attach(&container)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;
    engine
        .start(&container)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;

    execution.enter(ExecutionState::Running);
    let mut frames_rx = attached.frames;

    let wait_result = tokio::time::timeout(
        execution.deadline.saturating_duration_since(std::time::Instant::now()),
        engine.wait(&container),
    )
    .await;

    let exit_code = match wait_result {
        Ok(Ok(status)) => status.code,
        Ok(Err(e)) => {
            warn!(execution_id = %execution.id, error = %e, "wait failed");
            -1
        }
        Err(_elapsed) => {
            execution.enter(ExecutionState::Stopping);
            let _ = engine.stop(&container, STOP_GRACE).await;
            -1
        }
    };

    execution.enter(ExecutionState::Draining);
    let mut frames = Vec::new();
    while let Some(item) = frames_rx.recv().await {
        match item {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                // A truncated or unreadable trailing frame still yields
                // whatever output was already demuxed, rather than discarding it.
                warn!(execution_id = %execution.id, error = %e, "stream read error while draining, returning partial output");
                break;
            }
        }
    }

    execution.exit_code = Some(exit_code);
    Ok((frames, exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{collect, encode_frame, StreamKind};
    use crate::driver::fake::FakeEngine;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    #[tokio::test]
    async fn hello_python_succeeds() {
        let frames = vec![crate::demux::Frame {
            kind: StreamKind::Stdout,
            payload: b"Hello\n".to_vec().into(),
        }];
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(frames, 0));
        let queue = AdmissionQueue::new(5);

        let result = execute_batch(
            &queue,
            engine,
            registry(),
            BatchDeadlines::default(),
            BatchRequest {
                language: "python".into(),
                code: "print('Hello')".into(),
                stdin: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status, Status::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "Hello\n");
    }

    #[tokio::test]
    async fn unknown_language_is_a_validation_error() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(vec![], 0));
        let queue = AdmissionQueue::new(5);

        let err = execute_batch(
            &queue,
            engine,
            registry(),
            BatchDeadlines::default(),
            BatchRequest { language: "cobol".into(), code: "x".into(), stdin: None },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_code_is_rejected_before_admission() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(vec![], 0));
        let queue = AdmissionQueue::new(5);

        let err = execute_batch(
            &queue,
            engine,
            registry(),
            BatchDeadlines::default(),
            BatchRequest {
                language: "python".into(),
                code: "x".repeat(MAX_CODE_CHARS + 1),
                stdin: None,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_error_status_not_an_orchestrator_error() {
        let frames = vec![crate::demux::Frame {
            kind: StreamKind::Stderr,
            payload: b"Traceback...\n".to_vec().into(),
        }];
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(frames, 1));
        let queue = AdmissionQueue::new(5);

        let result = execute_batch(
            &queue,
            engine,
            registry(),
            BatchDeadlines::default(),
            BatchRequest { language: "python".into(), code: "1/0".into(), stdin: None },
        )
        .await
        .unwrap();

        assert_eq!(result.status, Status::Error);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Traceback"));
    }

    #[tokio::test]
    async fn mixed_stdout_stderr_frames_preserve_combined_ordering() {
        let frames = vec![
            crate::demux::Frame { kind: StreamKind::Stdout, payload: b"a".to_vec().into() },
            crate::demux::Frame { kind: StreamKind::Stderr, payload: b"b".to_vec().into() },
            crate::demux::Frame { kind: StreamKind::Stdout, payload: b"c".to_vec().into() },
        ];
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(frames, 0));
        let queue = AdmissionQueue::new(5);

        let result = execute_batch(
            &queue,
            engine,
            registry(),
            BatchDeadlines::default(),
            BatchRequest { language: "python".into(), code: "...".into(), stdin: None },
        )
        .await
        .unwrap();

        assert_eq!(result.output, "abc");
    }

    // helper used only to confirm encode_frame round-trips through the
    // FakeEngine exactly as it would through DockerEngine's re-framing.
    #[test]
    fn encode_frame_matches_demux_expectations() {
        let wire = encode_frame(StreamKind::Stdout, b"z");
        let frames = collect(&wire).unwrap();
        assert_eq!(frames[0].payload.as_ref(), b"z");
    }
}
