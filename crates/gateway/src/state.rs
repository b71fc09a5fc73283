//! Application state management.

use std::sync::Arc;

use codecell_sandbox::{AdmissionQueue, DockerEngine, Registry, SandboxEngine};

use crate::config::Config;

/// Shared application state: one Admission Queue and one Docker connection
/// for the whole process, handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<AdmissionQueue>,
    pub engine: Arc<dyn SandboxEngine>,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let engine: Arc<dyn SandboxEngine> = Arc::new(DockerEngine::connect()?);
        let queue = Arc::new(AdmissionQueue::new(config.max_concurrent_executions));
        let registry = Arc::new(Registry::new());

        Ok(Self { queue, engine, registry, config: Arc::new(config.clone()) })
    }
}
