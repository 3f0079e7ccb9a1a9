//! Thin GitHub client backing `GET /api/github/repos`.

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

const GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct RepoRow {
    full_name: String,
    default_branch: String,
    private: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    /// `owner/name`, the id session creation accepts as `repoId`.
    pub id: String,
    pub default_branch: String,
    pub private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Repos visible to the stored token, most recently pushed first.
pub async fn list_repos(token: &str) -> Result<Vec<RepoInfo>, ServerError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("moor/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| ServerError::Internal(error.to_string()))?;

    let response = client
        .get(format!("{GITHUB_API}/user/repos"))
        .query(&[("per_page", "100"), ("sort", "pushed")])
        .bearer_auth(token)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .map_err(|error| ServerError::Internal(format!("github request failed: {error}")))?;

    if !response.status().is_success() {
        return Err(ServerError::Internal(format!(
            "github returned {}",
            response.status()
        )));
    }

    let rows: Vec<RepoRow> = response
        .json()
        .await
        .map_err(|error| ServerError::Internal(format!("github response malformed: {error}")))?;

    Ok(rows
        .into_iter()
        .map(|row| RepoInfo {
            id: row.full_name,
            default_branch: row.default_branch,
            private: row.private,
            description: row.description,
        })
        .collect())
}
