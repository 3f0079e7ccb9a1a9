//! Append-only per-session event journal with dense, monotonically
//! increasing `seq` values.

use rusqlite::params;
use serde_json::Value;

use moor_shared::models::now_iso;
use moor_shared::models::wire::EventEnvelope;

use super::{Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub session_id: String,
    pub seq: i64,
    pub kind: String,
    pub payload: Value,
    pub created_at: String,
}

impl JournalEntry {
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            seq: self.seq,
            kind: self.kind.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl Store {
    /// Append one event and return its `seq`. The MAX(seq) read and the
    /// insert run in one transaction on the single store connection, so two
    /// appends to the same session cannot interleave and `seq` stays dense.
    pub fn append_event(
        &self,
        session_id: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM journal WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let seq = last + 1;

        tx.execute(
            "INSERT INTO journal (session_id, seq, type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, seq, kind, payload.to_string(), now_iso()],
        )?;

        tx.commit()?;
        Ok(seq)
    }

    /// Entries with `seq > after_seq`, ascending. `limit` bounds REST pages;
    /// replay passes `None`.
    pub fn read_events_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, type, payload, created_at FROM journal
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;

        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![session_id, after_seq, limit], |row| {
            let payload: String = row.get(3)?;
            Ok(JournalEntry {
                session_id: row.get(0)?,
                seq: row.get(1)?,
                kind: row.get(2)?,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                created_at: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Highest `seq` for a session; 0 when the journal is empty.
    pub fn last_seq(&self, session_id: &str) -> Result<i64, StoreError> {
        let conn = self.conn();
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM journal WHERE session_id = ?1",
            params![session_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(last.unwrap_or(0))
    }

    /// Retention pruning by `created_at`. Idempotent; surviving entries keep
    /// their seq values, so per-session monotonicity is preserved.
    pub fn prune_events_older_than(&self, cutoff_iso: &str) -> Result<usize, StoreError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM journal WHERE created_at < ?1",
            params![cutoff_iso],
        )?;
        Ok(removed)
    }

    /// Drop a session's journal entirely (session GC).
    pub fn prune_session_events(&self, session_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM journal WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(removed)
    }
}
