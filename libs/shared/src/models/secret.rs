use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Well-known secret ids with fixed kinds and env var names.
pub const SECRET_ANTHROPIC_API_KEY: &str = "anthropic_api_key";
pub const SECRET_GITHUB_TOKEN: &str = "github_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    AiProvider,
    EnvVar,
    SandboxProvider,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::AiProvider => "ai_provider",
            SecretKind::EnvVar => "env_var",
            SecretKind::SandboxProvider => "sandbox_provider",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecretKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ai_provider" => Ok(SecretKind::AiProvider),
            "env_var" => Ok(SecretKind::EnvVar),
            "sandbox_provider" => Ok(SecretKind::SandboxProvider),
            other => Err(format!("unknown secret kind: {other}")),
        }
    }
}

/// Kind and default env var for the closed set of well-known ids.
pub fn well_known_secret(id: &str) -> Option<(SecretKind, &'static str)> {
    match id {
        SECRET_ANTHROPIC_API_KEY => Some((SecretKind::AiProvider, "ANTHROPIC_API_KEY")),
        SECRET_GITHUB_TOKEN => Some((SecretKind::SandboxProvider, "GITHUB_TOKEN")),
        _ => None,
    }
}

/// Everything about a secret except its value. This is the only shape the
/// REST surface ever returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    pub id: String,
    pub name: String,
    pub env_var_name: String,
    pub kind: SecretKind,
    pub enabled: bool,
    pub key_version: u32,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_ids_have_fixed_env_vars() {
        let (kind, env) = well_known_secret(SECRET_ANTHROPIC_API_KEY).expect("known id");
        assert_eq!(kind, SecretKind::AiProvider);
        assert_eq!(env, "ANTHROPIC_API_KEY");
        assert!(well_known_secret("my_custom_secret").is_none());
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            SecretKind::AiProvider,
            SecretKind::EnvVar,
            SecretKind::SandboxProvider,
        ] {
            assert_eq!(kind.as_str().parse::<SecretKind>(), Ok(kind));
        }
    }
}
