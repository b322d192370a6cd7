//! Provisioning of per-session sandboxes.
//!
//! A session is either unbound or bound to exactly one running sandbox. When
//! a session is rebound, the sandbox it held before is stopped in a detached
//! task that outlives the request.

use crate::error::{Error, Result};
use crate::runtime::{ContainerSpec, ResourceLimits, RuntimeBackend, RuntimeError, RuntimeRef};
use crate::session::SessionData;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct LifecycleManager {
    backend: Arc<dyn RuntimeBackend>,
    limits: ResourceLimits,
    working_dir: String,
}

impl LifecycleManager {
    pub fn new(
        backend: Arc<dyn RuntimeBackend>,
        limits: ResourceLimits,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            limits,
            working_dir: working_dir.into(),
        }
    }

    /// Whether a request for `runtime` must provision a sandbox.
    ///
    /// Callers check this before [`provision`](Self::provision); provisioning
    /// itself does not re-check the binding.
    pub fn needs_provisioning(session: &SessionData, is_new: bool, runtime: &RuntimeRef) -> bool {
        is_new || !session.bound_to(runtime)
    }

    /// Create and start a sandbox for `runtime`, bind it to `session`, and
    /// retire whatever sandbox the session held before.
    ///
    /// On failure the session is left untouched. If the returned future is
    /// dropped after the container was created but before it was bound, the
    /// container is removed in the background.
    pub async fn provision(&self, session: &mut SessionData, runtime: &RuntimeRef) -> Result<String> {
        let image = runtime.image();
        let provision_err = |source| Error::Provision {
            image: image.clone(),
            source,
        };

        self.ensure_image(&image).await.map_err(provision_err)?;
        let pending = self.create_and_start(&image).await.map_err(provision_err)?;

        let id = pending.bind();
        let previous = std::mem::replace(&mut session.sandbox, id.clone());
        session.runtime = Some(runtime.clone());
        info!(session = %session.id, sandbox = %id, image = %image, "Bound sandbox to session");

        if !previous.is_empty() && previous != id {
            self.retire(previous);
        }
        Ok(id)
    }

    /// Pull `image` if the engine lacks it. The pull runs in its own task and
    /// finishes even when the caller gives up waiting.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.backend.image_exists(image).await? {
            debug!(image, "Image present locally");
            return Ok(());
        }

        info!(image, "Image not found locally, pulling");
        let backend = Arc::clone(&self.backend);
        let span = info_span!("pull", image = %image);
        let reference = image.to_string();
        tokio::spawn(async move { pull(backend.as_ref(), &reference).await }.instrument(span))
            .await
            .map_err(|e| RuntimeError::Pull(e.to_string()))?
    }

    async fn create_and_start(&self, image: &str) -> Result<PendingSandbox, RuntimeError> {
        let spec = ContainerSpec {
            image: image.to_string(),
            working_dir: self.working_dir.clone(),
            limits: self.limits,
        };
        let created = self.backend.create_container(&spec).await?;
        for w in &created.warnings {
            warn!(image, sandbox = %created.id, "Container create: {}", w);
        }
        let pending = PendingSandbox::new(Arc::clone(&self.backend), created.id);

        let started = async {
            self.backend
                .update_container(&pending.id, &self.limits)
                .await?;
            self.backend.start_container(&pending.id).await
        }
        .await;

        if let Err(e) = started {
            let id = pending.bind();
            warn!(image, sandbox = %id, error = %e, "Sandbox failed to start, removing it");
            if let Err(rm) = self.backend.remove_container(&id).await {
                warn!(sandbox = %id, error = %rm, "Removing half-created sandbox failed");
            }
            return Err(e);
        }

        info!(image, sandbox = %pending.id, "Sandbox started");
        Ok(pending)
    }

    /// Stop a superseded sandbox without blocking the caller.
    ///
    /// The task is not tied to any request and keeps running if the request
    /// that triggered it goes away.
    pub fn retire(&self, sandbox: String) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let span = info_span!("retire", sandbox = %sandbox);
        tokio::spawn(
            async move {
                match backend.stop_container(&sandbox).await {
                    Ok(()) => info!("Stopped superseded sandbox"),
                    Err(e) => warn!(error = %e, "Error attempting to stop superseded sandbox"),
                }
            }
            .instrument(span),
        )
    }
}

async fn pull(backend: &dyn RuntimeBackend, image: &str) -> Result<(), RuntimeError> {
    let mut stream = backend.pull_image(image).await?;
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        if let Some(error) = msg.error {
            return Err(RuntimeError::Pull(error));
        }
        debug!(
            status = msg.status.as_deref().unwrap_or_default(),
            progress = msg.progress.as_deref().unwrap_or_default(),
            "Pull progress"
        );
    }
    info!("Image pulled");
    Ok(())
}

/// A created container that no session owns yet.
///
/// Dropping it unbound removes the container in a detached task.
struct PendingSandbox {
    backend: Arc<dyn RuntimeBackend>,
    id: String,
    armed: bool,
}

impl PendingSandbox {
    fn new(backend: Arc<dyn RuntimeBackend>, id: String) -> Self {
        Self {
            backend,
            id,
            armed: true,
        }
    }

    /// Hand the container over to the caller.
    fn bind(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.id)
    }
}

impl Drop for PendingSandbox {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = std::mem::take(&mut self.id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(sandbox = %id, "No runtime left to remove abandoned sandbox");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let span = info_span!("abandon", sandbox = %id);
        handle.spawn(
            async move {
                match backend.remove_container(&id).await {
                    Ok(()) => info!("Removed sandbox abandoned mid-provision"),
                    Err(e) => warn!(error = %e, "Error removing abandoned sandbox"),
                }
            }
            .instrument(span),
        );
    }
}
