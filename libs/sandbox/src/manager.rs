//! Multi-provider registry. Routes every operation by the
//! `(providerType, providerId)` pair stored on the session row; holds no
//! per-session state of its own.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use moor_shared::models::sandbox::ProviderType;

use crate::channel::AgentChannel;
use crate::provider::{SandboxError, SandboxHandle, SandboxProvider, SandboxSpec};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub enabled: bool,
    pub available: bool,
}

pub struct SandboxManager {
    providers: HashMap<ProviderType, Arc<dyn SandboxProvider>>,
    default_provider: ProviderType,
}

impl SandboxManager {
    pub fn new(default_provider: ProviderType) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider,
        }
    }

    /// Register a provider instance. Providers are installed once at
    /// startup; the registry is read-only afterwards.
    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        self.providers.insert(provider.provider_type(), provider);
    }

    pub fn default_provider(&self) -> ProviderType {
        self.default_provider
    }

    fn provider(
        &self,
        provider_type: ProviderType,
    ) -> Result<&Arc<dyn SandboxProvider>, SandboxError> {
        self.providers.get(&provider_type).ok_or_else(|| {
            SandboxError::ProviderUnavailable(format!(
                "provider {provider_type} is not enabled on this host"
            ))
        })
    }

    /// Provision a sandbox for a session, using the default provider when
    /// none is requested.
    pub async fn create_for_session(
        &self,
        spec: SandboxSpec,
        provider_type: Option<ProviderType>,
    ) -> Result<(ProviderType, Arc<dyn SandboxHandle>), SandboxError> {
        let provider_type = provider_type.unwrap_or(self.default_provider);
        let provider = self.provider(provider_type)?;

        if !provider.is_available().await {
            return Err(SandboxError::ProviderUnavailable(format!(
                "provider {provider_type} is not reachable"
            )));
        }

        let handle = provider.create_sandbox(spec).await?;
        Ok((provider_type, handle))
    }

    pub async fn get_handle(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        self.provider(provider_type)?.get_sandbox(provider_id).await
    }

    pub async fn resume_session(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
        secrets: Option<HashMap<String, String>>,
        repo_auth_token: Option<String>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let handle = self.get_handle(provider_type, provider_id).await?;
        handle.resume(secrets, repo_auth_token).await?;
        Ok(handle)
    }

    pub async fn attach_session(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
    ) -> Result<(Arc<dyn SandboxHandle>, AgentChannel), SandboxError> {
        let handle = self.get_handle(provider_type, provider_id).await?;
        let channel = handle.attach().await?;
        Ok((handle, channel))
    }

    /// Terminate a sandbox. A sandbox that is already gone counts as
    /// terminated.
    pub async fn terminate(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
    ) -> Result<(), SandboxError> {
        match self.get_handle(provider_type, provider_id).await {
            Ok(handle) => handle.terminate().await,
            Err(SandboxError::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Run GC across every registered provider.
    pub async fn cleanup_all(&self) -> HashMap<ProviderType, crate::provider::CleanupReport> {
        let mut reports = HashMap::new();
        for (provider_type, provider) in &self.providers {
            match provider.cleanup().await {
                Ok(report) => {
                    reports.insert(*provider_type, report);
                }
                Err(error) => {
                    tracing::warn!(provider = %provider_type, %error, "provider cleanup failed");
                }
            }
        }
        reports
    }

    /// Daemon health per provider type, for the UI.
    pub async fn provider_status(&self) -> HashMap<ProviderType, ProviderHealth> {
        let mut statuses = HashMap::new();
        for provider_type in ProviderType::ALL {
            let health = match self.providers.get(&provider_type) {
                Some(provider) => ProviderHealth {
                    enabled: true,
                    available: provider.is_available().await,
                },
                None => ProviderHealth {
                    enabled: false,
                    available: false,
                },
            };
            statuses.insert(provider_type, health);
        }
        statuses
    }
}
