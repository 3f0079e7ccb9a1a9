//! MicroVM sandbox provider.
//!
//! Delegates to a configured VM monitor command (cloud-hypervisor wrapper,
//! krunvm, ...) that boots the image and execs the agent with its stdio on
//! the monitor process. Same contract as the container provider, stronger
//! isolation, weaker pause: suspending stops the VM process outright, so
//! `losslessPause` is advertised as `false` while the workspace survives on
//! its host mount (`persistentDisk: true`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use moor_shared::models::sandbox::{ProviderType, ResourceTier, SandboxCapabilities, SandboxStatus};

use crate::channel::{AgentChannel, ChannelHub};
use crate::proc_io::{WiredProcess, wire_child};
use crate::provider::{
    CleanupReport, SandboxError, SandboxHandle, SandboxInfo, SandboxProvider, SandboxSpec,
    StatusCell,
};

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    lossless_pause: false,
    persistent_disk: true,
};

#[derive(Debug, Clone)]
pub struct MicroVmProviderConfig {
    /// VM monitor binary plus fixed leading arguments.
    pub monitor_command: Vec<String>,
    /// Default guest image; environment templates may override.
    pub image: String,
    pub state_dir: PathBuf,
}

/// Resource tier mapping passed to the monitor.
fn tier_args(tier: ResourceTier) -> (&'static str, &'static str) {
    match tier {
        ResourceTier::Small => ("1024", "1"),
        ResourceTier::Medium => ("2048", "2"),
        ResourceTier::Large => ("4096", "4"),
    }
}

pub struct MicroVmProvider {
    config: MicroVmProviderConfig,
    sandboxes: Mutex<HashMap<String, Arc<MicroVmSandbox>>>,
}

impl MicroVmProvider {
    pub fn new(config: MicroVmProviderConfig) -> Self {
        Self {
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.state_dir.join("sessions").join(session_id)
    }
}

struct VmLaunch {
    image: String,
    tier: ResourceTier,
    env: HashMap<String, String>,
}

#[async_trait]
impl SandboxProvider for MicroVmProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Microvm
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    async fn is_available(&self) -> bool {
        let Some(binary) = self.config.monitor_command.first().cloned() else {
            return false;
        };
        tokio::process::Command::new(binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn create_sandbox(
        &self,
        spec: SandboxSpec,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let session_dir = self.session_dir(&spec.session_id);
        for sub in ["workspace", "agent", "git"] {
            tokio::fs::create_dir_all(session_dir.join(sub)).await?;
        }

        let provider_id = format!("vm-{}", spec.session_id);
        let sandbox = Arc::new(MicroVmSandbox {
            provider_id: provider_id.clone(),
            session_id: spec.session_id.clone(),
            session_dir,
            monitor_command: self.config.monitor_command.clone(),
            launch: VmLaunch {
                image: spec
                    .image
                    .clone()
                    .unwrap_or_else(|| self.config.image.clone()),
                tier: spec.resource_tier,
                env: spec.env.clone(),
            },
            hub: ChannelHub::new(),
            status: StatusCell::new(SandboxStatus::Creating),
            process: Mutex::new(None),
        });

        sandbox.write_secret_env(&spec.secrets).await?;
        sandbox.launch().await?;
        sandbox.status.set(SandboxStatus::Running);

        tracing::info!(
            session_id = %spec.session_id,
            vm = %provider_id,
            "microvm sandbox started"
        );

        let mut sandboxes = self.sandboxes.lock().await;
        sandboxes.insert(provider_id, sandbox.clone());
        Ok(sandbox)
    }

    async fn get_sandbox(
        &self,
        provider_id: &str,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        match sandboxes.get(provider_id) {
            Some(sandbox) if sandbox.status.get() != SandboxStatus::Stopped => {
                Ok(sandbox.clone())
            }
            _ => Err(SandboxError::NotFound(provider_id.to_string())),
        }
    }

    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        Ok(sandboxes
            .values()
            .filter(|sandbox| sandbox.status.get() != SandboxStatus::Stopped)
            .map(|sandbox| SandboxInfo {
                provider_id: sandbox.provider_id.clone(),
                provider_type: ProviderType::Microvm,
                status: sandbox.status.get(),
                session_id: Some(sandbox.session_id.clone()),
            })
            .collect())
    }

    async fn cleanup(&self) -> Result<CleanupReport, SandboxError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let stopped: Vec<String> = sandboxes
            .iter()
            .filter(|(_, sandbox)| sandbox.status.get() == SandboxStatus::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            sandboxes.remove(id);
        }
        Ok(CleanupReport {
            removed: stopped.len(),
            artifacts: stopped,
        })
    }
}

struct MicroVmSandbox {
    provider_id: String,
    session_id: String,
    session_dir: PathBuf,
    monitor_command: Vec<String>,
    launch: VmLaunch,
    hub: Arc<ChannelHub>,
    status: StatusCell,
    process: Mutex<Option<WiredProcess>>,
}

impl MicroVmSandbox {
    async fn write_secret_env(
        &self,
        secrets: &HashMap<String, String>,
    ) -> Result<(), SandboxError> {
        let mut env_block = String::new();
        for (env_var, value) in secrets {
            env_block.push_str(env_var);
            env_block.push('=');
            env_block.push_str(value);
            env_block.push('\n');
        }
        tokio::fs::write(self.session_dir.join("agent").join("credentials.env"), env_block)
            .await?;
        Ok(())
    }

    async fn remove_secret_env(&self) {
        let _ = tokio::fs::remove_file(self.session_dir.join("agent").join("credentials.env"))
            .await;
    }

    /// Boot (or re-boot) the VM against the persistent workspace mount.
    async fn launch(&self) -> Result<(), SandboxError> {
        let Some((binary, fixed_args)) = self.monitor_command.split_first() else {
            return Err(SandboxError::ProviderUnavailable(
                "microvm monitor command is empty".to_string(),
            ));
        };

        let (memory_mib, vcpus) = tier_args(self.launch.tier);
        let mut cmd = tokio::process::Command::new(binary);
        cmd.args(fixed_args)
            .args(["--image", &self.launch.image])
            .args(["--memory-mib", memory_mib])
            .args(["--vcpus", vcpus])
            .args([
                "--workspace",
                &self.session_dir.join("workspace").display().to_string(),
            ])
            .args([
                "--env-file",
                &self
                    .session_dir
                    .join("agent")
                    .join("credentials.env")
                    .display()
                    .to_string(),
            ]);

        for (key, value) in &self.launch.env {
            cmd.args(["--env", &format!("{key}={value}")]);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Provision(format!("failed to spawn vm monitor: {e}")))?;

        let status = self.status.subscribe();
        let cell = self.status.clone();
        let wired = wire_child(
            &self.hub,
            child,
            self.session_dir.join("stderr.log"),
            move |expected| {
                if !expected && *status.borrow() != SandboxStatus::Paused {
                    cell.set(SandboxStatus::Stopped);
                }
            },
        )
        .await;

        let mut process = self.process.lock().await;
        if let Some(old) = process.take() {
            old.abort_pumps();
        }
        *process = Some(wired);
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for MicroVmSandbox {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn status(&self) -> SandboxStatus {
        self.status.get()
    }

    fn watch_status(&self) -> watch::Receiver<SandboxStatus> {
        self.status.subscribe()
    }

    async fn resume(
        &self,
        secrets: Option<HashMap<String, String>>,
        _repo_auth_token: Option<String>,
    ) -> Result<(), SandboxError> {
        if self.status.get() == SandboxStatus::Running {
            return Ok(());
        }

        if let Some(secrets) = secrets.as_ref() {
            self.write_secret_env(secrets).await?;
        }
        self.launch().await?;
        self.status.set(SandboxStatus::Running);
        Ok(())
    }

    /// Lossy pause: the VM process is stopped; only the workspace survives.
    async fn pause(&self) -> Result<(), SandboxError> {
        if self.status.get() == SandboxStatus::Paused {
            return Ok(());
        }

        self.status.set(SandboxStatus::Paused);
        if let Some(process) = self.process.lock().await.take() {
            process.kill();
        }
        self.remove_secret_env().await;
        Ok(())
    }

    async fn attach(&self) -> Result<AgentChannel, SandboxError> {
        if self.status.get() == SandboxStatus::Stopped {
            return Err(SandboxError::NotFound(self.provider_id.clone()));
        }
        Ok(self.hub.attach().await)
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        self.status.set(SandboxStatus::Stopping);
        if let Some(process) = self.process.lock().await.take() {
            process.kill();
        }
        self.hub.notify_peer_exit().await;
        self.remove_secret_env().await;
        self.status.set(SandboxStatus::Stopped);

        tracing::info!(
            session_id = %self.session_id,
            vm = %self.provider_id,
            "microvm sandbox terminated"
        );
        Ok(())
    }
}
