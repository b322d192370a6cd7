//! Shared application state handed to every handler.

use crate::lifecycle::LifecycleManager;
use crate::pipeline::ExecutionPipeline;
use crate::runtime::{ResourceLimits, RuntimeBackend, WORKING_DIR};
use crate::session::{SessionLocks, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub locks: SessionLocks,
    pub lifecycle: Arc<LifecycleManager>,
    pub pipeline: Arc<ExecutionPipeline>,
    /// Directory holding static assets.
    pub app_dir: PathBuf,
}

impl AppState {
    pub fn new(
        sessions: SessionStore,
        backend: Arc<dyn RuntimeBackend>,
        limits: ResourceLimits,
        app_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sessions: Arc::new(sessions),
            locks: SessionLocks::new(),
            lifecycle: Arc::new(LifecycleManager::new(
                Arc::clone(&backend),
                limits,
                WORKING_DIR,
            )),
            pipeline: Arc::new(ExecutionPipeline::new(backend, WORKING_DIR)),
            app_dir: app_dir.into(),
        }
    }
}
