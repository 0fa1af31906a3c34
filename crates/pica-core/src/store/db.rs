//! SQLite-backed library database: connection, migrations, timestamps.
//!
//! Row CRUD lives in `tasks`, `comics`, and `auth`.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Build a `sqlite://` URI from a filesystem path. The URI parser treats
/// `%`, `?`, `#`, `&`, and spaces specially, so those are percent-escaped;
/// everything else passes through untouched.
fn sqlite_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut uri = String::with_capacity(raw.len() + 12);
    uri.push_str("sqlite://");
    for c in raw.chars() {
        if matches!(c, '%' | '?' | '#' | '&' | ' ') {
            uri.push('%');
            uri.push_str(&format!("{:02X}", c as u32));
        } else {
            uri.push(c);
        }
    }
    uri
}

/// Handle to the library database (`<storage>/library.db`).
#[derive(Clone)]
pub struct Library {
    pub(crate) pool: Pool<Sqlite>,
}

impl Library {
    /// Open (or create) the database at `path` and run migrations. Creates
    /// parent directories if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let db = Library { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                params_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                comic_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comics (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                subtitle TEXT NOT NULL DEFAULT '',
                source INTEGER NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                directory TEXT NOT NULL,
                time INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                meta_json TEXT NOT NULL,
                cover_path TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_sessions (
                source TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Current time as epoch milliseconds (for row timestamps).
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
/// Open an in-memory database for tests (no disk I/O).
pub(crate) async fn open_memory() -> Result<Library> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let db = Library { pool };
    db.migrate().await?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_uri_escapes_reserved_chars() {
        let uri = sqlite_uri(Path::new("/tmp/my library #1/x?.db"));
        assert_eq!(uri, "sqlite:///tmp/my%20library%20%231/x%3F.db");
        let uri = sqlite_uri(Path::new("/plain/library.db"));
        assert_eq!(uri, "sqlite:///plain/library.db");
    }
}
