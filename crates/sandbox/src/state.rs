//! Per-execution lifecycle, deadline, and cleanup guarantees.
//!
//! `Execution` tracks which resources have been acquired as a small stack
//! (`Vec<Acquired>`) pushed to as each step of `preparing`/`building`/
//! `starting` succeeds. `cleanup()` unwinds that stack in reverse order
//! regardless of how the execution got there — normal exit, deadline,
//! cancellation, or a fatal error partway through setup — the Rust-idiomatic
//! rendering of a stack of deferred release actions. Every step is
//! best-effort: a failure is logged at `warn` and never stops the rest of
//! the unwind (`CleanupError`).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::driver::{ContainerHandle, SandboxEngine};

/// 128-bit random execution identifier. Used as the sole key for input
/// routing and work-directory naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for ExecutionId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0.to_string())
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Batch,
    Interactive,
}

/// States in the execution lifecycle. `Stopping` is the deadline/cancellation
/// detour on top of the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Admitted,
    Preparing,
    Building,
    Starting,
    Running,
    Stopping,
    Draining,
    Cleanup,
    Done,
}

/// One resource acquired by an in-flight execution, in the order it was
/// acquired. Popped in reverse during `cleanup`.
///
/// No `Image` arm: batch executions bake source into a tmpfs inside an
/// ephemeral container rather than building a per-request image, so there is
/// no image to remove. A driver that reintroduces ephemeral image builds
/// needs a matching `Acquired::Image` arm here.
enum Acquired {
    WorkDir(PathBuf),
    Container(ContainerHandle),
}

pub struct Execution {
    pub id: ExecutionId,
    pub mode: ExecutionMode,
    pub work_dir: PathBuf,
    pub state: ExecutionState,
    pub deadline: Instant,
    pub exit_code: Option<i64>,
    history: Vec<ExecutionState>,
    acquired: Vec<Acquired>,
}

impl Execution {
    pub fn new(mode: ExecutionMode, work_dir: PathBuf, deadline_from_now: Duration) -> Self {
        Self {
            id: ExecutionId::new(),
            mode,
            work_dir,
            state: ExecutionState::Admitted,
            deadline: Instant::now() + deadline_from_now,
            exit_code: None,
            history: vec![ExecutionState::Admitted],
            acquired: Vec::new(),
        }
    }

    pub fn enter(&mut self, state: ExecutionState) {
        self.state = state;
        self.history.push(state);
    }

    /// The sequence of states entered so far, oldest first. Used by tests to
    /// assert transition ordering (testable property 4's state-machine
    /// analogue).
    pub fn history(&self) -> &[ExecutionState] {
        &self.history
    }

    pub fn is_deadline_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn note_workdir_acquired(&mut self) {
        self.acquired.push(Acquired::WorkDir(self.work_dir.clone()));
    }

    pub fn note_container_acquired(&mut self, container: ContainerHandle) {
        self.acquired.push(Acquired::Container(container));
    }

    pub fn container(&self) -> Option<&ContainerHandle> {
        self.acquired.iter().rev().find_map(|a| match a {
            Acquired::Container(c) => Some(c),
            _ => None,
        })
    }

    /// Unwind every acquired resource in reverse order. Idempotent — calling
    /// it twice (e.g. once from an error path, once from the executor's
    /// normal tail) is safe because resources are drained from the stack as
    /// they're released.
    pub async fn cleanup(&mut self, engine: &dyn SandboxEngine) {
        self.enter(ExecutionState::Cleanup);

        while let Some(resource) = self.acquired.pop() {
            match resource {
                Acquired::Container(handle) => {
                    if let Err(e) = engine.remove_container(&handle).await {
                        warn!(execution_id = %self.id, error = %e, "failed to remove container");
                    }
                }
                Acquired::WorkDir(path) => {
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(execution_id = %self.id, error = %e, path = %path.display(), "failed to remove work dir");
                        }
                    }
                }
            }
        }

        self.enter(ExecutionState::Done);
    }
}
