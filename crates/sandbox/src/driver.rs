//! Thin, typed wrapper over the container engine.
//!
//! `SandboxEngine` is the trait boundary the rest of the orchestrator talks
//! to; `DockerEngine` is the only production implementation, built over
//! `bollard`. Keeping the engine behind a trait means `state.rs`,
//! `queue.rs`, `batch.rs`, and `interactive.rs` are all testable against
//! `FakeEngine` without a Docker daemon.
//!
//! Materializing a per-request environment is done by creating a fresh,
//! never-reused container from the language's prebuilt image and writing
//! the source (and `input.txt`) into it over a `create_exec` + stdin pipe
//! before running it. This sidesteps a Dockerfile/`docker build` pipeline
//! entirely: the container itself is the ephemeral, disposable unit
//! (created once, never reused, always removed), which satisfies the
//! isolation and filesystem-permission goals of "baking" source into a
//! container rather than an image.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::secret::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::demux::{encode_frame, Demultiplexer, Frame, StreamKind};
use crate::limits::ResourceLimits;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("sandbox start failed: {0}")]
    StartFailed(String),
    #[error("container write failed: {0}")]
    WriteFailed(String),
    #[error("container read failed: {0}")]
    ReadFailed(String),
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<bollard::errors::Error> for DriverError {
    fn from(e: bollard::errors::Error) -> Self {
        DriverError::Engine(e.to_string())
    }
}

/// Opaque handle to a created container. Carries no behavior of its own —
/// every operation on it goes through `SandboxEngine`, which is what lets
/// the driver enforce attach-before-start structurally in `state.rs`.
#[derive(Debug, Clone)]
pub struct ContainerHandle(pub String);

#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub code: i64,
}

/// Options for container creation: a per-language `ResourceLimits` plus a
/// mode-dependent mount/stdin shape.
#[derive(Debug, Clone)]
pub struct ContainerOpts {
    pub limits: ResourceLimits,
    pub open_stdin: bool,
    pub working_dir: String,
    /// `(host_path, container_path)` read-write bind mount, used by the
    /// interactive executor's shared work volume. Batch executions have no
    /// bind mount — their one-shot `/code` is a writable tmpfs instead.
    pub bind_mount: Option<(String, String)>,
}

/// Live attachment to a container's multiplexed stream, obtained *before*
/// `start` per the hard attach-before-start contract.
pub struct AttachedStream {
    /// Demultiplexed frames, in arrival order, fed by a background task that
    /// reads bollard's `LogOutput` and funnels it through our own
    /// `Demultiplexer` (see module docs).
    pub frames: mpsc::UnboundedReceiver<Result<Frame, DriverError>>,
    /// Write half of stdin, present only when the container was created
    /// with `open_stdin`.
    pub stdin: Option<std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>>,
}

/// The container-engine contract the orchestrator depends on: a thin
/// create/start/attach/wait/stop/remove/build surface, with the real engine
/// treated as an external collaborator behind this trait.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    async fn create_container(
        &self,
        image: &str,
        cmd: Vec<String>,
        opts: &ContainerOpts,
    ) -> Result<ContainerHandle, DriverError>;

    /// Write a file into a not-yet-started container (the "build" step, per
    /// module docs: source and `input.txt` injection, not an image build).
    async fn write_file(
        &self,
        container: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DriverError>;

    /// Must be called before `start` — returns the live multiplexed stream.
    async fn attach(&self, container: &ContainerHandle) -> Result<AttachedStream, DriverError>;

    async fn start(&self, container: &ContainerHandle) -> Result<(), DriverError>;

    async fn wait(&self, container: &ContainerHandle) -> Result<ExitStatus, DriverError>;

    /// Graceful stop with the given grace period, then kill.
    async fn stop(&self, container: &ContainerHandle, grace: Duration) -> Result<(), DriverError>;

    async fn remove_container(&self, container: &ContainerHandle) -> Result<(), DriverError>;

    /// Best-effort; a failure here is a `CleanupError`, logged and never
    /// surfaced to the caller.
    async fn remove_image(&self, _image: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Production engine over `bollard::Docker`.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    async fn create_container(
        &self,
        image: &str,
        cmd: Vec<String>,
        opts: &ContainerOpts,
    ) -> Result<ContainerHandle, DriverError> {
        let container_name = format!("codecell-{}", uuid::Uuid::new_v4());

        let mut tmpfs = HashMap::new();
        if opts.bind_mount.is_none() {
            tmpfs.insert(
                opts.working_dir.clone(),
                "rw,noexec,nosuid,size=32m".to_string(),
            );
        }
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=64m".to_string());

        let binds = opts
            .bind_mount
            .as_ref()
            .map(|(host, container)| vec![format!("{host}:{container}:rw")]);

        let host_config = HostConfig {
            memory: Some(opts.limits.memory_bytes as i64),
            memory_swap: Some(opts.limits.memory_bytes as i64),
            nano_cpus: Some(opts.limits.nano_cpus),
            pids_limit: Some(opts.limits.pids_limit),
            // A sandbox is never reachable on any network.
            network_mode: Some("none".to_string()),
            privileged: Some(false),
            readonly_rootfs: Some(opts.bind_mount.is_none()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nproc".to_string()),
                soft: Some(opts.limits.pids_limit),
                hard: Some(opts.limits.pids_limit),
            }]),
            tmpfs: Some(tmpfs),
            binds,
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            host_config: Some(host_config),
            working_dir: Some(opts.working_dir.clone()),
            user: Some("coderunner".to_string()),
            tty: Some(false),
            open_stdin: Some(opts.open_stdin),
            attach_stdin: Some(opts.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name,
                    platform: None,
                }),
                config,
            )
            .await?;

        Ok(ContainerHandle(response.id))
    }

    async fn write_file(
        &self,
        container: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DriverError> {
        let exec = self
            .docker
            .create_exec(
                &container.0,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("cat > {path}"),
                    ]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut input, mut output } =
            self.docker.start_exec(&exec.id, None::<StartExecOptions>).await?
        {
            input
                .write_all(contents)
                .await
                .map_err(|e| DriverError::WriteFailed(e.to_string()))?;
            input
                .shutdown()
                .await
                .map_err(|e| DriverError::WriteFailed(e.to_string()))?;
            while output.next().await.is_some() {
                // drain the write-exec's own output so it can exit.
            }
        }

        Ok(())
    }

    async fn attach(&self, container: &ContainerHandle) -> Result<AttachedStream, DriverError> {
        use bollard::container::AttachContainerOptions;

        let results = self
            .docker
            .attach_container(
                &container.0,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut output = results.output;

        tokio::spawn(async move {
            let mut demux = Demultiplexer::new();
            while let Some(item) = output.next().await {
                let wire = match item {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        encode_frame(StreamKind::Stdout, &message)
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        encode_frame(StreamKind::Stderr, &message)
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(Err(DriverError::ReadFailed(e.to_string())));
                        break;
                    }
                };
                match demux.push(&wire) {
                    Ok(frames) => {
                        for frame in frames {
                            if tx.send(Ok(frame)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(DriverError::ReadFailed(e.to_string())));
                        return;
                    }
                }
            }
        });

        Ok(AttachedStream {
            frames: rx,
            stdin: Some(results.input),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> Result<(), DriverError> {
        use bollard::container::StartContainerOptions;
        self.docker
            .start_container(&container.0, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DriverError::StartFailed(e.to_string()))
    }

    async fn wait(&self, container: &ContainerHandle) -> Result<ExitStatus, DriverError> {
        use bollard::container::WaitContainerOptions;
        let mut stream = self
            .docker
            .wait_container(&container.0, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus { code: response.status_code }),
            Some(Err(e)) => Err(DriverError::ReadFailed(e.to_string())),
            None => Err(DriverError::ReadFailed("wait stream ended with no result".into())),
        }
    }

    async fn stop(&self, container: &ContainerHandle, grace: Duration) -> Result<(), DriverError> {
        let _ = self
            .docker
            .stop_container(
                &container.0,
                Some(StopContainerOptions { t: grace.as_secs() as i64 }),
            )
            .await;
        Ok(())
    }

    async fn remove_container(&self, container: &ContainerHandle) -> Result<(), DriverError> {
        self.docker
            .remove_container(
                &container.0,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! A scripted, Docker-free `SandboxEngine` for unit-testing the state
    //! machine, queue, and executors.

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{AttachedStream, ContainerHandle, ContainerOpts, DriverError, ExitStatus, SandboxEngine};
    use crate::demux::{Frame, StreamKind};

    /// One scripted frame to be delivered on attach.
    pub fn scripted_frame(kind: StreamKind, payload: &str) -> Frame {
        Frame { kind, payload: payload.as_bytes().to_vec().into() }
    }

    pub struct FakeEngine {
        pub scripted_frames: Mutex<Vec<Frame>>,
        pub exit_code: i64,
        pub writes: Mutex<Vec<(String, Vec<u8>)>>,
        pub started: Mutex<bool>,
        pub removed: Mutex<bool>,
        pub stopped: Mutex<bool>,
        /// If set, `wait` never resolves — used to test deadline handling
        /// without a real multi-minute sleep.
        pub hang_forever: bool,
    }

    impl FakeEngine {
        pub fn new(scripted_frames: Vec<Frame>, exit_code: i64) -> Self {
            Self {
                scripted_frames: Mutex::new(scripted_frames),
                exit_code,
                writes: Mutex::new(Vec::new()),
                started: Mutex::new(false),
                removed: Mutex::new(false),
                stopped: Mutex::new(false),
                hang_forever: false,
            }
        }

        pub fn hanging() -> Self {
            Self { hang_forever: true, ..Self::new(vec![], 0) }
        }
    }

    #[async_trait]
    impl SandboxEngine for FakeEngine {
        async fn create_container(
            &self,
            _image: &str,
            _cmd: Vec<String>,
            _opts: &ContainerOpts,
        ) -> Result<ContainerHandle, DriverError> {
            Ok(ContainerHandle("fake-container".to_string()))
        }

        async fn write_file(
            &self,
            _container: &ContainerHandle,
            path: &str,
            contents: &[u8],
        ) -> Result<(), DriverError> {
            self.writes.lock().unwrap().push((path.to_string(), contents.to_vec()));
            Ok(())
        }

        async fn attach(&self, _container: &ContainerHandle) -> Result<AttachedStream, DriverError> {
            let (tx, rx) = mpsc::unbounded_channel();
            for frame in self.scripted_frames.lock().unwrap().drain(..) {
                let _ = tx.send(Ok(frame));
            }
            Ok(AttachedStream { frames: rx, stdin: None })
        }

        async fn start(&self, _container: &ContainerHandle) -> Result<(), DriverError> {
            *self.started.lock().unwrap() = true;
            Ok(())
        }

        async fn wait(&self, _container: &ContainerHandle) -> Result<ExitStatus, DriverError> {
            if self.hang_forever {
                std::future::pending::<()>().await;
            }
            Ok(ExitStatus { code: self.exit_code })
        }

        async fn stop(&self, _container: &ContainerHandle, _grace: Duration) -> Result<(), DriverError> {
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }

        async fn remove_container(&self, _container: &ContainerHandle) -> Result<(), DriverError> {
            *self.removed.lock().unwrap() = true;
            Ok(())
        }
    }
}
