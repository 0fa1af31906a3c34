//! Upstream credential blobs, stored verbatim per source.
//!
//! The server never refreshes sessions; when one expires the task fails and
//! the client pushes fresh credentials here.

use anyhow::{Context, Result};
use sqlx::Row;

use super::db::{unix_millis, Library};
use crate::sources::SourceKind;

impl Library {
    /// Store the opaque auth payload for a source, replacing any previous
    /// one.
    pub async fn put_auth(&self, source: SourceKind, payload: &serde_json::Value) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO auth_sessions (source, payload_json, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(source.as_str())
        .bind(payload_json)
        .bind(unix_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored payload and its update time, if the client ever pushed one.
    pub async fn get_auth(
        &self,
        source: SourceKind,
    ) -> Result<Option<(serde_json::Value, i64)>> {
        let row = sqlx::query(
            r#"SELECT payload_json, updated_at FROM auth_sessions WHERE source = ?1"#,
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let payload_json: String = row.get("payload_json");
                let payload =
                    serde_json::from_str(&payload_json).context("parse auth payload_json")?;
                Ok(Some((payload, row.get("updated_at"))))
            }
            None => Ok(None),
        }
    }
}
