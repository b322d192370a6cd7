//! Docker Engine client.

use crate::runtime::{
    ContainerSpec, CreatedContainer, ExecSpec, PullProgress, PullStream, ResourceLimits,
    RuntimeBackend, RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UpdateContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::debug;

/// Engine endpoint used when none is configured.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Seconds before an engine request is abandoned.
const ENGINE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    Socket(String),
    Http(String),
}

/// Talks to a Docker-compatible engine over a unix socket or TCP.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    endpoint: String,
}

impl DockerBackend {
    /// `endpoint` may be `unix:///path`, an absolute socket path, `tcp://`,
    /// `http://` or a bare `host:port`.
    pub fn new(endpoint: &str) -> Result<Self, RuntimeError> {
        let docker = match parse_endpoint(endpoint)? {
            Endpoint::Socket(path) => {
                Docker::connect_with_socket(&path, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Endpoint::Http(addr) => Docker::connect_with_http(
                &format!("http://{addr}"),
                ENGINE_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?,
        };
        Ok(Self {
            docker,
            endpoint: endpoint.trim().to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Endpoint, RuntimeError> {
    let endpoint = endpoint.trim();
    if let Some(path) = endpoint.strip_prefix("unix://") {
        return Ok(Endpoint::Socket(path.to_string()));
    }
    if endpoint.starts_with('/') {
        return Ok(Endpoint::Socket(endpoint.to_string()));
    }
    let addr = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
        .trim_end_matches('/');
    if addr.is_empty() || addr.contains("://") {
        return Err(RuntimeError::Endpoint(endpoint.to_string()));
    }
    Ok(Endpoint::Http(addr.to_string()))
}

/// Split `name:tag`, keeping registry ports (`host:5000/name`) in the name.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (reference, "latest"),
    }
}

fn host_config(limits: &ResourceLimits) -> HostConfig {
    HostConfig {
        cpu_shares: Some(limits.cpu_shares),
        memory: Some(limits.memory),
        cpu_period: Some(limits.cpu_period),
        cpu_quota: Some(limits.cpu_quota),
        storage_opt: (limits.disk_quota > 0)
            .then(|| HashMap::from([("size".to_string(), limits.disk_quota.to_string())])),
        ..Default::default()
    }
}

/// Write a demultiplexed chunk back as an engine frame.
fn reframe(chunk: &LogOutput, out: &mut Vec<u8>) {
    let (stream, message) = match chunk {
        LogOutput::StdIn { message } => (0u8, message),
        LogOutput::StdOut { message } | LogOutput::Console { message } => (1, message),
        LogOutput::StdErr { message } => (2, message),
    };
    out.extend_from_slice(&[stream, 0, 0, 0]);
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
}

/// 304 from start and stop means the container is already in that state.
fn not_modified_ok(result: Result<(), BollardError>) -> Result<(), RuntimeError> {
    match result {
        Err(BollardError::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => Ok(other?),
    }
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<PullStream, RuntimeError> {
        let (name, tag) = split_reference(reference);
        debug!(image = reference, "Pulling image");
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let stream = self
            .docker
            .create_image(Some(options), None, None)
            .map(|item| -> Result<PullProgress, RuntimeError> {
                let info = item?;
                Ok(PullProgress {
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                })
            });
        Ok(stream.boxed())
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, RuntimeError> {
        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config(&spec.limits)),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        Ok(CreatedContainer {
            id: created.id,
            warnings: created.warnings,
        })
    }

    async fn update_container(
        &self,
        id: &str,
        limits: &ResourceLimits,
    ) -> Result<(), RuntimeError> {
        let options = UpdateContainerOptions::<String> {
            cpu_shares: Some(limits.cpu_shares as isize),
            memory: Some(limits.memory),
            cpu_period: Some(limits.cpu_period),
            cpu_quota: Some(limits.cpu_quota),
            ..Default::default()
        };
        self.docker.update_container(id, options).await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        not_modified_ok(
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        not_modified_ok(self.docker.stop_container(id, None).await)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path,
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await?;
        Ok(())
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        Ok(self.docker.create_exec(id, options).await?.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<Bytes, RuntimeError> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                let mut raw = Vec::new();
                while let Some(chunk) = output.next().await {
                    reframe(&chunk?, &mut raw);
                }
                Ok(Bytes::from(raw))
            }
            StartExecResults::Detached => Ok(Bytes::new()),
        }
    }
}
