//! Environment templates. At most one default per sandbox type, enforced in
//! the same transaction as the write.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};

use moor_shared::models::environment::Environment;
use moor_shared::models::now_iso;
use moor_shared::models::sandbox::{ProviderType, ResourceTier};

use super::{Store, StoreError};

fn row_to_environment(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let sandbox_type: String = row.get("sandbox_type")?;
    let resources: String = row.get("resources")?;
    Ok(Environment {
        id: row.get("id")?,
        name: row.get("name")?,
        sandbox_type: ProviderType::from_str(&sandbox_type).unwrap_or(ProviderType::Mock),
        image: row.get("image")?,
        resources: ResourceTier::from_str(&resources).unwrap_or_default(),
        is_default: row.get("is_default")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Insert or replace an environment. Setting `is_default` demotes any
    /// previous default for the same sandbox type in the same transaction.
    pub fn upsert_environment(&self, environment: &Environment) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if environment.is_default {
            tx.execute(
                "UPDATE environments SET is_default = 0 WHERE sandbox_type = ?1 AND id != ?2",
                params![environment.sandbox_type.as_str(), environment.id],
            )?;
        }

        let created_at: Option<String> = tx
            .query_row(
                "SELECT created_at FROM environments WHERE id = ?1",
                params![environment.id],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT OR REPLACE INTO environments
                 (id, name, sandbox_type, image, resources, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                environment.id,
                environment.name,
                environment.sandbox_type.as_str(),
                environment.image,
                environment.resources.as_str(),
                environment.is_default,
                created_at.unwrap_or_else(|| environment.created_at.clone()),
                now_iso(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_environment(&self, id: &str) -> Result<Environment, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, sandbox_type, image, resources, is_default, created_at, updated_at
             FROM environments WHERE id = ?1",
            params![id],
            row_to_environment,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("environment {id}")))
    }

    pub fn list_environments(&self) -> Result<Vec<Environment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, sandbox_type, image, resources, is_default, created_at, updated_at
             FROM environments ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_environment)?;

        let mut environments = Vec::new();
        for row in rows {
            environments.push(row?);
        }
        Ok(environments)
    }

    pub fn default_environment(
        &self,
        sandbox_type: ProviderType,
    ) -> Result<Option<Environment>, StoreError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id, name, sandbox_type, image, resources, is_default, created_at,
                        updated_at
                 FROM environments WHERE sandbox_type = ?1 AND is_default = 1",
                params![sandbox_type.as_str()],
                row_to_environment,
            )
            .optional()?)
    }

    /// Idempotent delete.
    pub fn delete_environment(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM environments WHERE id = ?1", params![id])?;
        Ok(())
    }
}
