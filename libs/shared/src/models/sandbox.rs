use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of sandbox providers. Dispatch is by this tag stored on the
/// session row — never by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Mock,
    Container,
    Microvm,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Mock => "mock",
            ProviderType::Container => "container",
            ProviderType::Microvm => "microvm",
        }
    }

    pub const ALL: [ProviderType; 3] = [
        ProviderType::Mock,
        ProviderType::Container,
        ProviderType::Microvm,
    ];
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mock" => Ok(ProviderType::Mock),
            "container" => Ok(ProviderType::Container),
            "microvm" => Ok(ProviderType::Microvm),
            other => Err(format!("unknown sandbox provider: {other}")),
        }
    }
}

/// Provider-side sandbox state machine. The provider is the source of
/// truth; the session row mirrors a coarse view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a provider advertises at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCapabilities {
    pub lossless_pause: bool,
    pub persistent_disk: bool,
}

/// Coarse resource tier; each provider maps it to its own limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    #[default]
    Small,
    Medium,
    Large,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Small => "small",
            ResourceTier::Medium => "medium",
            ResourceTier::Large => "large",
        }
    }
}

impl FromStr for ResourceTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "small" => Ok(ResourceTier::Small),
            "medium" => Ok(ResourceTier::Medium),
            "large" => Ok(ResourceTier::Large),
            other => Err(format!("unknown resource tier: {other}")),
        }
    }
}
