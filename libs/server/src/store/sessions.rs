//! Session rows. Status transitions are optimistic: every UPDATE carries a
//! `WHERE status = expected` guard so an invalid transition loses the race
//! instead of corrupting the state machine.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};

use moor_shared::models::now_iso;
use moor_shared::models::sandbox::ProviderType;
use moor_shared::models::session::{
    ModelPreference, SandboxBinding, Session, SessionMode, SessionStatus,
};

use super::{Store, StoreError};

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let provider_type: Option<String> = row.get("provider_type")?;
    let provider_sandbox_id: Option<String> = row.get("provider_sandbox_id")?;
    let model_provider: Option<String> = row.get("model_provider")?;
    let model_id: Option<String> = row.get("model_id")?;

    let sandbox = match (provider_type, provider_sandbox_id) {
        (Some(provider_type), Some(provider_sandbox_id)) => {
            ProviderType::from_str(&provider_type)
                .ok()
                .map(|provider_type| SandboxBinding {
                    provider_type,
                    provider_sandbox_id,
                    image_digest: row.get::<_, Option<String>>("image_digest").ok().flatten(),
                })
        }
        _ => None,
    };

    let model = match (model_provider, model_id) {
        (Some(provider), Some(model_id)) => Some(ModelPreference { provider, model_id }),
        _ => None,
    };

    Ok(Session {
        id: row.get("id")?,
        mode: SessionMode::from_str(&mode).unwrap_or(SessionMode::Chat),
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Error),
        repo_id: row.get("repo_id")?,
        repo_branch: row.get("repo_branch")?,
        sandbox,
        model,
        environment_id: row.get("environment_id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
        last_activity_at: row.get("last_activity_at")?,
    })
}

const SESSION_COLUMNS: &str = "id, mode, status, repo_id, repo_branch, provider_type, \
     provider_sandbox_id, image_digest, model_provider, model_id, environment_id, name, \
     created_at, last_activity_at";

impl Store {
    pub fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (id, mode, status, repo_id, repo_branch, environment_id,
                 model_provider, model_id, name, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id,
                session.mode.as_str(),
                session.status.as_str(),
                session.repo_id,
                session.repo_branch,
                session.environment_id,
                session.model.as_ref().map(|m| m.provider.clone()),
                session.model.as_ref().map(|m| m.model_id.clone()),
                session.name,
                session.created_at,
                session.last_activity_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a session row regardless of status. Callers hide `deleted`.
    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// All sessions except `deleted`, newest first.
    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE status != 'deleted'
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Optimistic status transition. Returns false when the row was not in
    /// `expected` (someone else won the race, or the transition is stale).
    pub fn transition_session(
        &self,
        id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::Conflict(format!(
                "illegal session transition {expected} -> {next}"
            )));
        }

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, last_activity_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![next.as_str(), now_iso(), id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Move a session to `error` from any state the machine allows.
    pub fn mark_session_error(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'error', last_activity_at = ?1
             WHERE id = ?2 AND status IN ('creating', 'ready', 'running', 'paused', 'stopped')",
            params![now_iso(), id],
        )?;
        Ok(changed == 1)
    }

    /// Record the sandbox binding and move `creating -> ready` atomically.
    pub fn bind_sandbox(
        &self,
        id: &str,
        provider_type: ProviderType,
        provider_sandbox_id: &str,
        image_digest: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET provider_type = ?1, provider_sandbox_id = ?2,
                 image_digest = ?3, status = 'ready', last_activity_at = ?4
             WHERE id = ?5 AND status = 'creating'",
            params![
                provider_type.as_str(),
                provider_sandbox_id,
                image_digest,
                now_iso(),
                id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Terminal cleanup: clear the binding and mark the row `deleted`. The
    /// row itself survives until GC; the journal is pruned separately.
    pub fn mark_session_deleted(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'deleted', provider_type = NULL,
                 provider_sandbox_id = NULL, image_digest = NULL, last_activity_at = ?1
             WHERE id = ?2 AND status = 'stopped'",
            params![now_iso(), id],
        )?;
        Ok(changed == 1)
    }

    /// Explicit GC: drop rows that have been `deleted`.
    pub fn purge_deleted_sessions(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM sessions WHERE status = 'deleted'", [])?)
    }

    pub fn set_session_model(
        &self,
        id: &str,
        provider: &str,
        model_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET model_provider = ?1, model_id = ?2, last_activity_at = ?3
             WHERE id = ?4",
            params![provider, model_id, now_iso(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    pub fn touch_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![now_iso(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            mode: SessionMode::Chat,
            status: SessionStatus::Creating,
            repo_id: None,
            repo_branch: None,
            sandbox: None,
            model: None,
            environment_id: None,
            name: format!("session {id}"),
            created_at: now_iso(),
            last_activity_at: now_iso(),
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");

        let loaded = store.get_session("s-1").expect("get");
        assert_eq!(loaded.status, SessionStatus::Creating);
        assert_eq!(loaded.name, "session s-1");
        assert!(store.get_session("nope").is_err());
    }

    #[test]
    fn bind_sandbox_moves_creating_to_ready() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");

        let bound = store
            .bind_sandbox("s-1", ProviderType::Mock, "mock-s-1", Some("sha256:abc"))
            .expect("bind");
        assert!(bound);

        let loaded = store.get_session("s-1").expect("get");
        assert_eq!(loaded.status, SessionStatus::Ready);
        let binding = loaded.sandbox.expect("binding");
        assert_eq!(binding.provider_sandbox_id, "mock-s-1");
        assert_eq!(binding.image_digest.as_deref(), Some("sha256:abc"));

        // Binding twice loses the optimistic check.
        let rebound = store
            .bind_sandbox("s-1", ProviderType::Mock, "mock-other", None)
            .expect("bind");
        assert!(!rebound);
    }

    #[test]
    fn provider_sandbox_id_is_unique_per_provider() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");
        store.insert_session(&session("s-2")).expect("insert");

        assert!(store
            .bind_sandbox("s-1", ProviderType::Mock, "mock-dup", None)
            .expect("bind"));
        let clash = store.bind_sandbox("s-2", ProviderType::Mock, "mock-dup", None);
        assert!(clash.is_err(), "unique index must reject the duplicate");
    }

    #[test]
    fn illegal_transitions_are_conflicts() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");

        let result =
            store.transition_session("s-1", SessionStatus::Creating, SessionStatus::Running);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn stale_transitions_lose_the_race() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");
        store
            .bind_sandbox("s-1", ProviderType::Mock, "mock-s-1", None)
            .expect("bind");

        // Row is `ready`; a transition expecting `running` must not apply.
        let applied = store
            .transition_session("s-1", SessionStatus::Running, SessionStatus::Paused)
            .expect("transition");
        assert!(!applied);
        assert_eq!(
            store.get_session("s-1").expect("get").status,
            SessionStatus::Ready
        );
    }

    #[test]
    fn deleted_sessions_are_hidden_from_listing_but_rows_survive() {
        let store = test_store();
        store.insert_session(&session("s-1")).expect("insert");
        store
            .bind_sandbox("s-1", ProviderType::Mock, "mock-s-1", None)
            .expect("bind");
        store
            .transition_session("s-1", SessionStatus::Ready, SessionStatus::Stopped)
            .expect("stop");
        assert!(store.mark_session_deleted("s-1").expect("delete"));

        assert!(store.list_sessions().expect("list").is_empty());
        let row = store.get_session("s-1").expect("row survives");
        assert_eq!(row.status, SessionStatus::Deleted);
        assert!(row.sandbox.is_none(), "binding cleared on delete");

        assert_eq!(store.purge_deleted_sessions().expect("gc"), 1);
        assert!(store.get_session("s-1").is_err());
    }
}
