use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::sandbox::ProviderType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Chat,
    Code,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Chat => "chat",
            SessionMode::Code => "code",
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chat" => Ok(SessionMode::Chat),
            "code" => Ok(SessionMode::Code),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

/// Session state machine:
///
/// ```text
/// creating ──► ready ──► running ◄──► paused
///     │          │          │            │
///     │          └────── stopped ◄───────┘      stopped ──► deleted
///     └───────────► error (from any non-terminal state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Ready,
    Running,
    Paused,
    Stopped,
    Error,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
            SessionStatus::Deleted => "deleted",
        }
    }

    /// States in which the session must hold a sandbox binding.
    pub fn has_sandbox(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::Running | SessionStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Deleted)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (*self, next),
            (Creating, Ready)
                | (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Ready | Running | Paused, Stopped)
                | (Error, Stopped)
                | (Stopped, Deleted)
                | (Creating | Ready | Running | Paused | Stopped, Error)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "creating" => Ok(SessionStatus::Creating),
            "ready" => Ok(SessionStatus::Ready),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            "deleted" => Ok(SessionStatus::Deleted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// The `(providerType, providerSandboxId, imageDigest)` triple recorded when
/// a sandbox is provisioned; cleared when the session is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxBinding {
    pub provider_type: ProviderType,
    pub provider_sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

/// AI model preference, changeable mid-session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPreference {
    pub provider: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelPreference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub name: String,
    pub created_at: String,
    pub last_activity_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use SessionStatus::*;
        let path = [Creating, Ready, Running, Paused, Running, Stopped, Deleted];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use SessionStatus::*;
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Error.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Creating.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Error));
    }

    #[test]
    fn sandbox_binding_states() {
        use SessionStatus::*;
        for status in [Ready, Running, Paused] {
            assert!(status.has_sandbox());
        }
        for status in [Creating, Stopped, Error, Deleted] {
            assert!(!status.has_sandbox());
        }
    }

    #[test]
    fn session_serializes_camel_case() {
        let session = Session {
            id: "s-1".into(),
            mode: SessionMode::Chat,
            status: SessionStatus::Ready,
            repo_id: None,
            repo_branch: None,
            sandbox: Some(SandboxBinding {
                provider_type: ProviderType::Mock,
                provider_sandbox_id: "mock-s-1".into(),
                image_digest: None,
            }),
            model: None,
            environment_id: None,
            name: "chat session".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            last_activity_at: "2026-01-01T00:00:00.000Z".into(),
        };

        let json = serde_json::to_value(&session).expect("serialize");
        assert_eq!(json["createdAt"], "2026-01-01T00:00:00.000Z");
        assert_eq!(json["sandbox"]["providerSandboxId"], "mock-s-1");
        assert!(json.get("repoId").is_none());
    }
}
