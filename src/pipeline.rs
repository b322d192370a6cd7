//! Runs a submitted job inside a bound sandbox.

use crate::archive::{self, SourceFile};
use crate::error::{Error, Result, TransferFailure};
use crate::output;
use crate::runtime::{ExecSpec, RuntimeBackend};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// A submission: argument vector, optional environment, and source files.
///
/// `cmd` is executed directly with no shell, so shell metacharacters in it
/// are ordinary argument text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmittedJob {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub files: Vec<SourceFile>,
}

impl SubmittedJob {
    pub fn validate(&self) -> Result<()> {
        if self.cmd.first().map_or(true, |c| c.is_empty()) {
            return Err(Error::BadRequest("cmd must name a program".into()));
        }
        if let Some(bad) = self.env.iter().find(|e| !e.contains('=') || e.starts_with('=')) {
            return Err(Error::BadRequest(format!(
                "env entry {bad:?} is not NAME=VALUE"
            )));
        }
        Ok(())
    }
}

pub struct ExecutionPipeline {
    backend: Arc<dyn RuntimeBackend>,
    working_dir: String,
}

impl ExecutionPipeline {
    pub fn new(backend: Arc<dyn RuntimeBackend>, working_dir: impl Into<String>) -> Self {
        Self {
            backend,
            working_dir: working_dir.into(),
        }
    }

    /// Copy the job's files into `sandbox`, run its command, and return the
    /// normalized combined output. Nothing is returned on partial failure.
    pub async fn execute(&self, sandbox: &str, job: &SubmittedJob) -> Result<String> {
        let transfer_err = |source: TransferFailure| Error::Transfer {
            sandbox: sandbox.to_string(),
            source,
        };
        let exec_err = |source| Error::Exec {
            sandbox: sandbox.to_string(),
            source,
        };

        let tarball = archive::encode(&job.files).map_err(|e| transfer_err(e.into()))?;
        debug!(sandbox, files = job.files.len(), bytes = tarball.len(), "Copying files in");
        self.backend
            .copy_to_container(sandbox, &self.working_dir, tarball)
            .await
            .map_err(|e| transfer_err(e.into()))?;

        let spec = ExecSpec {
            cmd: job.cmd.clone(),
            env: job.env.clone(),
        };
        let exec_id = self
            .backend
            .create_exec(sandbox, &spec)
            .await
            .map_err(exec_err)?;
        let raw = self
            .backend
            .attach_exec(&exec_id)
            .await
            .map_err(exec_err)?;

        let text = output::normalize(&raw);
        info!(sandbox, command = ?job.cmd, raw_len = raw.len(), output_len = text.len(), "Command finished");
        Ok(text)
    }
}
