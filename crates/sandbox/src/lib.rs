//! Execution orchestrator: admits, sandboxes, and streams untrusted code
//! execution under a global concurrency cap.
//!
//! This crate owns everything between "a validated request" and "a result or
//! a stream of events" — the container engine itself is reached only through
//! the [`driver::SandboxEngine`] trait, so the orchestration logic here is
//! testable without a Docker daemon.

pub mod batch;
pub mod demux;
pub mod driver;
pub mod error;
pub mod interactive;
pub mod limits;
pub mod queue;
pub mod registry;
pub mod state;

pub use batch::{execute_batch, BatchRequest, BatchResult, Status};
pub use driver::{DockerEngine, SandboxEngine};
pub use error::OrchestratorError;
pub use interactive::{start_interactive, InteractiveEvent, InteractiveInput, InteractiveRequest, InteractiveSession, OutputKind};
pub use limits::{BatchDeadlines, ResourceLimits, INTERACTIVE_DEADLINE};
pub use queue::AdmissionQueue;
pub use registry::{MemoryClass, Registry};
pub use state::{ExecutionId, ExecutionMode, ExecutionState};
