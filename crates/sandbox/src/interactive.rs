//! Long-lived interactive execution.
//!
//! Unlike `batch.rs`, the work directory is a host path bind-mounted
//! read-write into the container as a shared volume, so the source file is
//! written directly with `tokio::fs` rather than through an exec+stdin pipe
//! — there is no per-request image build and no ephemeral-container
//! indirection here, since startup latency matters for a session the caller
//! is actively watching.
//!
//! Input is delivered over a single channel shared for the whole session and
//! filtered by `ExecutionId`: a message addressed to any other execution is
//! dropped silently, never queued or rejected.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::batch::{build_cmd, Status};
use crate::demux::StreamKind;
use crate::driver::{ContainerOpts, SandboxEngine};
use crate::error::OrchestratorError;
use crate::limits::{ResourceLimits, INTERACTIVE_DEADLINE, STOP_GRACE};
use crate::queue::AdmissionQueue;
use crate::registry::Registry;
use crate::state::{Execution, ExecutionId, ExecutionMode, ExecutionState};

const MAX_CODE_CHARS: usize = 50_000;

#[derive(Debug, Clone)]
pub struct InteractiveRequest {
    pub language: String,
    pub code: String,
}

/// One piece of caller-supplied stdin, addressed to a specific execution.
#[derive(Debug, Clone)]
pub struct InteractiveInput {
    pub execution_id: ExecutionId,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// Every message an interactive session can emit, in the order the wire
/// protocol requires: exactly one `Start`, zero or more `Output`, an
/// optional `Error`, then exactly one `Complete`.
#[derive(Debug, Clone)]
pub enum InteractiveEvent {
    Start { id: ExecutionId },
    Output { id: ExecutionId, kind: OutputKind, data: Vec<u8> },
    Complete { id: ExecutionId, status: Status, exit_code: i64 },
    Error { id: ExecutionId, message: String },
}

pub struct InteractiveSession {
    pub input_tx: mpsc::UnboundedSender<InteractiveInput>,
    pub events_rx: mpsc::UnboundedReceiver<InteractiveEvent>,
}

fn validate(request: &InteractiveRequest, registry: &Registry) -> Result<(), OrchestratorError> {
    if request.code.chars().count() > MAX_CODE_CHARS {
        return Err(OrchestratorError::Validation(format!(
            "code exceeds {MAX_CODE_CHARS} code points"
        )));
    }
    registry
        .lookup(&request.language)
        .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
    Ok(())
}

/// Validate and admit an interactive session. Returns immediately with a
/// handle the caller drives for the session's whole lifetime; admission
/// itself never blocks, matching the Admission Queue's contract.
pub fn start_interactive(
    queue: &AdmissionQueue,
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<Registry>,
    request: InteractiveRequest,
) -> Result<InteractiveSession, OrchestratorError> {
    validate(&request, &registry)?;

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    queue.enqueue(async move {
        run_session(engine, registry, request, input_rx, events_tx).await;
    });

    Ok(InteractiveSession { input_tx, events_rx })
}

async fn run_session(
    engine: Arc<dyn SandboxEngine>,
    registry: Arc<Registry>,
    request: InteractiveRequest,
    mut input_rx: mpsc::UnboundedReceiver<InteractiveInput>,
    events_tx: mpsc::UnboundedSender<InteractiveEvent>,
) {
    let spec = match registry.lookup(&request.language) {
        Ok(spec) => spec.clone(),
        Err(e) => {
            // Admission already validated this; only a registry change
            // racing the request could land here.
            let id = ExecutionId::new();
            let _ = events_tx.send(InteractiveEvent::Error { id, message: e.to_string() });
            let _ = events_tx.send(InteractiveEvent::Complete {
                id,
                status: Status::Error,
                exit_code: -1,
            });
            return;
        }
    };

    let work_dir = std::env::temp_dir().join(format!("codecell-interactive-{}", uuid::Uuid::new_v4()));
    let mut execution = Execution::new(ExecutionMode::Interactive, work_dir, INTERACTIVE_DEADLINE);
    let id = execution.id;
    info!(execution_id = %id, language = %spec.tag, "interactive execution admitted");
    let _ = events_tx.send(InteractiveEvent::Start { id });

    let outcome = run_container(&mut execution, &*engine, &spec, &request.code, &mut input_rx, &events_tx).await;
    execution.cleanup(&*engine).await;

    match outcome {
        Ok(exit_code) => {
            let status = if exit_code == 0 { Status::Success } else { Status::Error };
            let _ = events_tx.send(InteractiveEvent::Complete { id, status, exit_code });
        }
        Err(e) => {
            let _ = events_tx.send(InteractiveEvent::Error { id, message: e.to_string() });
            let _ = events_tx.send(InteractiveEvent::Complete {
                id,
                status: Status::Error,
                exit_code: -1,
            });
        }
    }
}

async fn run_container(
    execution: &mut Execution,
    engine: &dyn SandboxEngine,
    spec: &crate::registry::LanguageSpec,
    code: &str,
    input_rx: &mut mpsc::UnboundedReceiver<InteractiveInput>,
    events_tx: &mpsc::UnboundedSender<InteractiveEvent>,
) -> Result<i64, OrchestratorError> {
    let id = execution.id;

    execution.enter(ExecutionState::Preparing);
    tokio::fs::create_dir_all(&execution.work_dir)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(format!("work dir: {e}")))?;
    execution.note_workdir_acquired();

    tokio::fs::write(execution.work_dir.join(spec.source_filename), code)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(format!("write source: {e}")))?;

    execution.enter(ExecutionState::Building);
    let cmd = build_cmd(&spec.run_command, spec.compile_run_command.as_deref(), None);
    let limits = ResourceLimits::for_memory_class(spec.memory_class);
    let opts = ContainerOpts {
        limits,
        open_stdin: true,
        working_dir: "/code".to_string(),
        bind_mount: Some((execution.work_dir.to_string_lossy().into_owned(), "/code".to_string())),
    };

    let container = engine
        .create_container(spec.image, cmd, &opts)
        .await
        .map_err(|e| OrchestratorError::SandboxStartFailed(e.to_string()))?;
    execution.note_container_acquired(container.clone());

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
    let mut stdin = attached.stdin;

    let wait_fut = engine.wait(&container);
    tokio::pin!(wait_fut);
    let deadline_sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(execution.deadline));
    tokio::pin!(deadline_sleep);

    let mut frames_done = false;
    let mut input_done = false;
    let mut stopping = false;

    let exit_code = loop {
        tokio::select! {
            frame = frames_rx.recv(), if !frames_done => {
                match frame {
                    Some(Ok(f)) => {
                        let kind = match f.kind {
                            StreamKind::Stdout => OutputKind::Stdout,
                            StreamKind::Stderr => OutputKind::Stderr,
                        };
                        let _ = events_tx.send(InteractiveEvent::Output { id, kind, data: f.payload.to_vec() });
                    }
                    Some(Err(e)) => {
                        warn!(execution_id = %id, error = %e, "stream read error");
                    }
                    None => {
                        frames_done = true;
                        if let Some(mut w) = stdin.take() {
                            let _ = w.shutdown().await;
                        }
                    }
                }
            }
            input = input_rx.recv(), if !input_done => {
                match input {
                    Some(msg) if msg.execution_id == id => {
                        if let Some(w) = stdin.as_mut() {
                            let mut line = msg.data;
                            if !line.ends_with('\n') {
                                line.push('\n');
                            }
                            let _ = w.write_all(line.as_bytes()).await;
                        }
                    }
                    // Input addressed to a different execution (a stale
                    // write from a reused transport) is dropped.
                    Some(_stale) => {}
                    None => {
                        input_done = true;
                        if !stopping {
                            stopping = true;
                            execution.enter(ExecutionState::Stopping);
                            let _ = engine.stop(&container, STOP_GRACE).await;
                        }
                    }
                }
            }
            _ = &mut deadline_sleep, if !stopping => {
                stopping = true;
                execution.enter(ExecutionState::Stopping);
                let _ = events_tx.send(InteractiveEvent::Output {
                    id,
                    kind: OutputKind::Stderr,
                    data: b"execution timed out\n".to_vec(),
                });
                let _ = engine.stop(&container, STOP_GRACE).await;
            }
            result = &mut wait_fut => {
                break match result {
                    Ok(status) => status.code,
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "wait failed");
                        -1
                    }
                };
            }
        }
    };

    execution.enter(ExecutionState::Draining);
    // The container has exited, but its stream may still hold output that
    // arrived right before exit; drain it so every `output` event precedes
    // `execution-complete` (the container's own fd close ends this).
    while let Some(item) = frames_rx.recv().await {
        match item {
            Ok(f) => {
                let kind = match f.kind {
                    StreamKind::Stdout => OutputKind::Stdout,
                    StreamKind::Stderr => OutputKind::Stderr,
                };
                let _ = events_tx.send(InteractiveEvent::Output { id, kind, data: f.payload.to_vec() });
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "stream read error while draining");
                break;
            }
        }
    }

    execution.exit_code = Some(exit_code);
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeEngine;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    #[tokio::test]
    async fn emits_start_before_any_output_then_complete() {
        let frames = vec![crate::demux::Frame {
            kind: StreamKind::Stdout,
            payload: b"A?".to_vec().into(),
        }];
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(frames, 0));
        let queue = AdmissionQueue::new(5);

        let mut session = start_interactive(
            &queue,
            engine,
            registry(),
            InteractiveRequest { language: "python".into(), code: "print('A?')".into() },
        )
        .unwrap();

        let first = session.events_rx.recv().await.unwrap();
        assert!(matches!(first, InteractiveEvent::Start { .. }));

        let mut saw_output = false;
        let mut completed = false;
        while let Some(event) = session.events_rx.recv().await {
            match event {
                InteractiveEvent::Output { .. } => saw_output = true,
                InteractiveEvent::Complete { status, exit_code, .. } => {
                    assert!(saw_output);
                    assert_eq!(status, Status::Success);
                    assert_eq!(exit_code, 0);
                    completed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn unknown_language_is_rejected_before_admission() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(vec![], 0));
        let queue = AdmissionQueue::new(5);

        let err = start_interactive(
            &queue,
            engine,
            registry(),
            InteractiveRequest { language: "cobol".into(), code: "x".into() },
        )
        .unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn stale_input_for_a_different_execution_is_dropped_not_rejected() {
        let engine: Arc<dyn SandboxEngine> = Arc::new(FakeEngine::new(vec![], 0));
        let queue = AdmissionQueue::new(5);

        let mut session = start_interactive(
            &queue,
            engine,
            registry(),
            InteractiveRequest { language: "python".into(), code: "pass".into() },
        )
        .unwrap();

        let start = session.events_rx.recv().await.unwrap();
        let real_id = match start {
            InteractiveEvent::Start { id } => id,
            _ => panic!("expected Start"),
        };

        // Input for some other execution id should be silently dropped: the
        // session still runs to completion rather than erroring out.
        session
            .input_tx
            .send(InteractiveInput { execution_id: ExecutionId::new(), data: "ignored".into() })
            .unwrap();
        assert_ne!(real_id, ExecutionId::new());

        let mut completed = false;
        while let Some(event) = session.events_rx.recv().await {
            if let InteractiveEvent::Complete { .. } = event {
                completed = true;
                break;
            }
        }
        assert!(completed);
    }
}
