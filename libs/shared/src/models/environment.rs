use serde::{Deserialize, Serialize};

use super::sandbox::{ProviderType, ResourceTier};

/// A stored sandbox configuration template: which image to boot and how
/// large a sandbox to give it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub sandbox_type: ProviderType,
    pub image: String,
    pub resources: ResourceTier,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}
