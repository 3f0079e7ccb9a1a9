//! The provider seam: every sandbox backend implements [`SandboxProvider`]
//! for provisioning and [`SandboxHandle`] for the lifetime of one sandbox.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use moor_shared::models::sandbox::{ProviderType, ResourceTier, SandboxCapabilities, SandboxStatus};

use crate::channel::AgentChannel;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("SANDBOX_NOT_FOUND: {0}")]
    NotFound(String),
    #[error("sandbox provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),
    #[error("sandbox operation failed: {0}")]
    Operation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a provider needs to provision one sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub session_id: String,
    /// Plain environment variables for the agent process.
    pub env: HashMap<String, String>,
    /// Secret material, keyed by env var name. Written to host-mounted
    /// credential files, never baked into the image.
    pub secrets: HashMap<String, String>,
    pub repo_url: Option<String>,
    pub repo_branch: Option<String>,
    pub resource_tier: ResourceTier,
    /// Image override from an environment template; providers fall back to
    /// their configured default.
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub provider_id: String,
    pub provider_type: ProviderType,
    pub status: SandboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: usize,
    pub artifacts: Vec<String>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn capabilities(&self) -> SandboxCapabilities;

    /// Cheap health probe (daemon ping, binary presence).
    async fn is_available(&self) -> bool;

    /// Provision infrastructure and start the agent. The returned handle's
    /// `provider_id` is stable for the sandbox's lifetime.
    async fn create_sandbox(&self, spec: SandboxSpec)
    -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    /// Reattach by id. Fails with [`SandboxError::NotFound`] when the
    /// backing resource is gone.
    async fn get_sandbox(&self, provider_id: &str)
    -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError>;

    /// Garbage-collect stopped and orphaned instances.
    async fn cleanup(&self) -> Result<CleanupReport, SandboxError>;
}

#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn provider_id(&self) -> &str;

    fn capabilities(&self) -> SandboxCapabilities;

    fn status(&self) -> SandboxStatus;

    /// Status mirror for the session service.
    fn watch_status(&self) -> watch::Receiver<SandboxStatus>;

    /// `paused → running`. Re-materializes ephemeral credential files with
    /// the supplied secret material before the agent resumes.
    async fn resume(
        &self,
        secrets: Option<HashMap<String, String>>,
        repo_auth_token: Option<String>,
    ) -> Result<(), SandboxError>;

    /// Best-effort suspend preserving the workspace. Whether memory state
    /// survives is advertised via `capabilities().lossless_pause`.
    async fn pause(&self) -> Result<(), SandboxError>;

    /// Open the agent channel, stealing stdin from any previous channel.
    async fn attach(&self) -> Result<AgentChannel, SandboxError>;

    /// Unconditionally move to `stopped`, closing any open channel and
    /// releasing provider resources.
    async fn terminate(&self) -> Result<(), SandboxError>;
}

/// Shared status cell for handle implementations.
#[derive(Clone)]
pub(crate) struct StatusCell {
    tx: watch::Sender<SandboxStatus>,
}

impl StatusCell {
    pub(crate) fn new(initial: SandboxStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SandboxStatus {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self, status: SandboxStatus) {
        self.tx.send_replace(status);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SandboxStatus> {
        self.tx.subscribe()
    }
}
