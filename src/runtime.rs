//! The container runtime as seen by the sandbox lifecycle and exec pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Directory inside every sandbox where submitted files land and commands run.
pub const WORKING_DIR: &str = "/work-area/";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container engine: {0}")]
    Engine(#[source] bollard::errors::Error),
    #[error("container engine returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unsupported container engine endpoint {0:?}")]
    Endpoint(String),
    #[error("image pull failed: {0}")]
    Pull(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api {
                status: status_code,
                message,
            },
            other => RuntimeError::Engine(other),
        }
    }
}

/// A `(language, version)` pair naming exactly one sandbox image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeRef {
    pub language: String,
    pub version: String,
}

impl RuntimeRef {
    /// Validate path segments into a runtime reference.
    pub fn parse(language: &str, version: &str) -> Option<Self> {
        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        };
        (valid(language) && valid(version)).then(|| Self {
            language: language.to_string(),
            version: version.to_string(),
        })
    }

    /// Image reference, `language:version`.
    pub fn image(&self) -> String {
        format!("{}:{}", self.language, self.version)
    }
}

impl fmt::Display for RuntimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.language, self.version)
    }
}

/// Fixed resource policy applied to every sandbox at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Relative CPU weight.
    pub cpu_shares: i64,
    /// Hard memory ceiling in bytes.
    pub memory: i64,
    /// CFS period in microseconds.
    pub cpu_period: i64,
    /// CPU time allowed per period, in microseconds.
    pub cpu_quota: i64,
    /// Writable layer quota in bytes, 0 for the engine default.
    pub disk_quota: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: 256,
            memory: 64 * 1024 * 1024,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            disk_quota: 0,
        }
    }
}

/// Everything needed to create a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub working_dir: String,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Default)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// A command to run inside a sandbox with stdout and stderr attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// `NAME=VALUE` overrides.
    pub env: Vec<String>,
}

/// One message of image pull progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub status: Option<String>,
    pub progress: Option<String>,
    /// Set when the engine reports the pull failed.
    pub error: Option<String>,
}

pub type PullStream = BoxStream<'static, Result<PullProgress, RuntimeError>>;

/// Operations the service needs from a container runtime.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<PullStream, RuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec)
        -> Result<CreatedContainer, RuntimeError>;

    async fn update_container(&self, id: &str, limits: &ResourceLimits)
        -> Result<(), RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Extract a tar archive into `path` inside the container.
    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError>;

    /// Returns the exec instance id.
    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, RuntimeError>;

    /// Start the exec and read its multiplexed output to completion.
    async fn attach_exec(&self, exec_id: &str) -> Result<Bytes, RuntimeError>;
}

/// In-memory runtime that records every call.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use futures_util::stream;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        ImageExists(String),
        PullImage(String),
        Create(ContainerSpec),
        Update(String, ResourceLimits),
        Start(String),
        Stop(String),
        Remove(String),
        Copy(String, String, Vec<u8>),
        CreateExec(String, ExecSpec),
        AttachExec(String),
    }

    #[derive(Default)]
    pub struct MockBackend {
        pub calls: Mutex<Vec<Call>>,
        pub local_images: Mutex<HashSet<String>>,
        pub pull_progress: Mutex<Vec<PullProgress>>,
        pub fail: Mutex<HashSet<&'static str>>,
        pub exec_output: Mutex<Vec<u8>>,
        /// When set, the matching call waits for a notification before returning.
        pub pull_gate: Mutex<Option<Arc<Notify>>>,
        pub start_gate: Mutex<Option<Arc<Notify>>>,
        pub stop_gate: Mutex<Option<Arc<Notify>>>,
        pub pulled: Notify,
        pub stopped: Notify,
        pub removed: Notify,
        next_id: Mutex<u32>,
    }

    impl MockBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_image(self: Arc<Self>, reference: &str) -> Arc<Self> {
            self.local_images.lock().unwrap().insert(reference.to_string());
            self
        }

        pub fn failing(self: Arc<Self>, op: &'static str) -> Arc<Self> {
            self.fail.lock().unwrap().insert(op);
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        async fn pass(gate: &Mutex<Option<Arc<Notify>>>) {
            let gate = gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn check(&self, op: &'static str) -> Result<(), RuntimeError> {
            if self.fail.lock().unwrap().contains(op) {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: format!("{op} failed"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RuntimeBackend for MockBackend {
        async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
            self.record(Call::ImageExists(reference.to_string()));
            self.check("image_exists")?;
            Ok(self.local_images.lock().unwrap().contains(reference))
        }

        async fn pull_image(&self, reference: &str) -> Result<PullStream, RuntimeError> {
            self.record(Call::PullImage(reference.to_string()));
            self.check("pull_image")?;
            Self::pass(&self.pull_gate).await;
            self.local_images.lock().unwrap().insert(reference.to_string());
            self.pulled.notify_one();
            let messages: Vec<Result<PullProgress, RuntimeError>> = self
                .pull_progress
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(Ok)
                .collect();
            Ok(Box::pin(stream::iter(messages)))
        }

        async fn create_container(
            &self,
            spec: &ContainerSpec,
        ) -> Result<CreatedContainer, RuntimeError> {
            self.record(Call::Create(spec.clone()));
            self.check("create_container")?;
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(CreatedContainer {
                id: format!("ctr-{}", *next),
                warnings: vec![],
            })
        }

        async fn update_container(
            &self,
            id: &str,
            limits: &ResourceLimits,
        ) -> Result<(), RuntimeError> {
            self.record(Call::Update(id.to_string(), *limits));
            self.check("update_container")
        }

        async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(Call::Start(id.to_string()));
            Self::pass(&self.start_gate).await;
            self.check("start_container")
        }

        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(Call::Stop(id.to_string()));
            Self::pass(&self.stop_gate).await;
            self.stopped.notify_one();
            self.check("stop_container")
        }

        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(Call::Remove(id.to_string()));
            self.removed.notify_one();
            self.check("remove_container")
        }

        async fn copy_to_container(
            &self,
            id: &str,
            path: &str,
            archive: Vec<u8>,
        ) -> Result<(), RuntimeError> {
            self.record(Call::Copy(id.to_string(), path.to_string(), archive));
            self.check("copy_to_container")
        }

        async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, RuntimeError> {
            self.record(Call::CreateExec(id.to_string(), spec.clone()));
            self.check("create_exec")?;
            Ok(format!("exec-{id}"))
        }

        async fn attach_exec(&self, exec_id: &str) -> Result<Bytes, RuntimeError> {
            self.record(Call::AttachExec(exec_id.to_string()));
            self.check("attach_exec")?;
            Ok(Bytes::from(self.exec_output.lock().unwrap().clone()))
        }
    }

    /// Build one multiplexed output frame.
    pub fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}
