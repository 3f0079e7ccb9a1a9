//! REST surface. Every response body is `{data, error}` with exactly one
//! side non-null.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use moor_shared::models::environment::Environment;
use moor_shared::models::now_iso;
use moor_shared::models::sandbox::{ProviderType, ResourceTier};
use moor_shared::models::secret::{SecretKind, well_known_secret};
use moor_shared::models::session::{Session, SessionMode};

use crate::error::ServerError;
use crate::session::CreateSessionParams;
use crate::state::AppState;
use crate::ws;
use crate::github;

type ApiResult = Result<Json<Value>, ServerError>;

fn ok(data: impl Serialize) -> ApiResult {
    let data = serde_json::to_value(data)
        .map_err(|error| ServerError::Internal(error.to_string()))?;
    Ok(Json(json!({"data": data, "error": null})))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/connect", get(connect_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/providers", get(provider_status))
        .route("/api/secrets", get(list_secrets))
        .route(
            "/api/secrets/{id}",
            put(put_secret).delete(delete_secret),
        )
        .route("/api/environments", get(list_environments).post(create_environment))
        .route(
            "/api/environments/{id}",
            put(update_environment).delete(delete_environment),
        )
        .route("/api/github/repos", get(github_repos))
        .route("/ws/sessions/{id}", get(ws::ws_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    ok(json!({"ok": true, "version": state.version}))
}

// ── Sessions ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    mode: String,
    #[serde(default)]
    repo_id: Option<String>,
    #[serde(default)]
    repo_branch: Option<String>,
    #[serde(default)]
    environment_id: Option<String>,
    #[serde(default)]
    model_provider: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(flatten)]
    session: Session,
    ws_endpoint: String,
}

impl SessionResponse {
    fn new(session: Session) -> Self {
        let ws_endpoint = format!("/ws/sessions/{}", session.id);
        Self {
            session,
            ws_endpoint,
        }
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult {
    let mode = SessionMode::from_str(&request.mode).map_err(ServerError::Validation)?;
    let session = state
        .sessions
        .create(CreateSessionParams {
            mode,
            repo_id: request.repo_id,
            repo_branch: request.repo_branch,
            environment_id: request.environment_id,
            model_provider: request.model_provider,
            model_id: request.model_id,
            system_prompt: request.system_prompt,
            name: request.name,
        })
        .await?;
    ok(SessionResponse::new(session))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult {
    let sessions: Vec<SessionResponse> = state
        .sessions
        .list()?
        .into_iter()
        .map(SessionResponse::new)
        .collect();
    ok(sessions)
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(SessionResponse::new(state.sessions.get(&id)?))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.sessions.delete(&id).await?;
    ok(json!({"deleted": true}))
}

async fn connect_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.sessions.get(&id)?;
    let last_seq = state.store.last_seq(&id)?;
    ok(json!({
        "sessionId": session.id,
        "status": session.status,
        "lastSeq": last_seq,
        "sandboxReady": session.status.has_sandbox(),
        "wsEndpoint": format!("/ws/sessions/{}", session.id),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    #[serde(default)]
    after_seq: i64,
    #[serde(default)]
    limit: Option<usize>,
}

/// History page, bounded by default so REST reads stay cheap.
const DEFAULT_EVENT_PAGE: usize = 500;

async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    state.sessions.get(&id)?;
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    let entries = state.store.read_events_after(&id, query.after_seq, Some(limit))?;
    let events: Vec<Value> = entries
        .iter()
        .map(|entry| {
            serde_json::to_value(entry.envelope())
                .unwrap_or(Value::Null)
        })
        .collect();
    ok(json!({"events": events, "lastSeq": state.store.last_seq(&id)?}))
}

async fn pause_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(SessionResponse::new(state.sessions.pause(&id).await?))
}

async fn resume_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(SessionResponse::new(state.sessions.resume(&id).await?))
}

async fn provider_status(State(state): State<AppState>) -> ApiResult {
    let statuses = state.manager.provider_status().await;
    let mut body = serde_json::Map::new();
    for (provider_type, health) in statuses {
        body.insert(
            provider_type.as_str().to_string(),
            serde_json::to_value(health).unwrap_or(Value::Null),
        );
    }
    ok(Value::Object(body))
}

// ── Secrets (metadata only; plaintext never leaves the store) ──────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutSecretRequest {
    value: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    env_var_name: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn put_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PutSecretRequest>,
) -> ApiResult {
    let (kind, env_var_name) = match well_known_secret(&id) {
        Some((kind, env_var)) => (kind, env_var.to_string()),
        None => {
            let kind = request
                .kind
                .as_deref()
                .ok_or_else(|| ServerError::validation("custom secrets require a kind"))?;
            let kind = SecretKind::from_str(kind).map_err(ServerError::Validation)?;
            let env_var = request
                .env_var_name
                .clone()
                .ok_or_else(|| ServerError::validation("custom secrets require an envVarName"))?;
            (kind, env_var)
        }
    };

    let name = request.name.clone().unwrap_or_else(|| id.clone());
    let metadata = state.store.put_secret(
        &id,
        &name,
        &env_var_name,
        kind,
        request.value.as_bytes(),
        request.enabled,
    )?;
    ok(metadata)
}

async fn list_secrets(State(state): State<AppState>) -> ApiResult {
    ok(state.store.list_secrets()?)
}

async fn delete_secret(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.store.delete_secret(&id)?;
    ok(json!({"deleted": true}))
}

// ── Environments ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentRequest {
    name: String,
    sandbox_type: String,
    image: String,
    #[serde(default)]
    resources: Option<String>,
    #[serde(default)]
    is_default: bool,
}

impl EnvironmentRequest {
    fn into_environment(self, id: String) -> Result<Environment, ServerError> {
        let sandbox_type =
            ProviderType::from_str(&self.sandbox_type).map_err(ServerError::Validation)?;
        let resources = match self.resources.as_deref() {
            Some(resources) => {
                ResourceTier::from_str(resources).map_err(ServerError::Validation)?
            }
            None => ResourceTier::default(),
        };
        Ok(Environment {
            id,
            name: self.name,
            sandbox_type,
            image: self.image,
            resources,
            is_default: self.is_default,
            created_at: now_iso(),
            updated_at: now_iso(),
        })
    }
}

async fn create_environment(
    State(state): State<AppState>,
    Json(request): Json<EnvironmentRequest>,
) -> ApiResult {
    let environment = request.into_environment(Uuid::new_v4().to_string())?;
    state.store.upsert_environment(&environment)?;
    ok(environment)
}

async fn update_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EnvironmentRequest>,
) -> ApiResult {
    state.store.get_environment(&id)?;
    let environment = request.into_environment(id)?;
    state.store.upsert_environment(&environment)?;
    ok(environment)
}

async fn list_environments(State(state): State<AppState>) -> ApiResult {
    ok(state.store.list_environments()?)
}

async fn delete_environment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.store.delete_environment(&id)?;
    ok(json!({"deleted": true}))
}

// ── GitHub collaborator surface ────────────────────────────────────────────

async fn github_repos(State(state): State<AppState>) -> ApiResult {
    let (_, token) = state
        .store
        .get_secret(moor_shared::models::secret::SECRET_GITHUB_TOKEN)
        .map_err(|_| ServerError::validation("no github_token secret is configured"))?;
    let token = String::from_utf8_lossy(&token).into_owned();
    ok(github::list_repos(&token).await?)
}
