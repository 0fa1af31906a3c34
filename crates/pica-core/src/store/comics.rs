//! Library (comics) row operations.

use anyhow::{Context, Result};
use sqlx::Row;

use super::db::Library;
use super::types::ComicRecord;

fn comic_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ComicRecord> {
    let tags_json: String = row.get("tags_json");
    let tags: Vec<String> = serde_json::from_str(&tags_json).context("parse comic tags_json")?;
    Ok(ComicRecord {
        id: row.get("id"),
        title: row.get("title"),
        subtitle: row.get("subtitle"),
        source: row.get("source"),
        tags,
        directory: row.get("directory"),
        time: row.get("time"),
        size: row.get("size"),
        meta_json: row.get("meta_json"),
        cover_path: row.get("cover_path"),
    })
}

impl Library {
    pub async fn comic_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query(r#"SELECT 1 FROM comics WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_comic(&self, id: &str) -> Result<Option<ComicRecord>> {
        let row = sqlx::query(r#"SELECT * FROM comics WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(comic_from_row).transpose()
    }

    /// Insert or replace the library row. Replace is the commit-over-orphan
    /// path: a directory left by a commit that died before its row insert is
    /// overwritten cleanly by the next commit for the same id.
    pub async fn upsert_comic(&self, rec: &ComicRecord) -> Result<()> {
        let tags_json = serde_json::to_string(&rec.tags)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO comics (
                id, title, subtitle, source, tags_json,
                directory, time, size, meta_json, cover_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.title)
        .bind(&rec.subtitle)
        .bind(rec.source)
        .bind(tags_json)
        .bind(&rec.directory)
        .bind(rec.time)
        .bind(rec.size)
        .bind(&rec.meta_json)
        .bind(&rec.cover_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_memory;

    fn sample(id: &str) -> ComicRecord {
        ComicRecord {
            id: id.to_string(),
            title: "Title".into(),
            subtitle: "Sub".into(),
            source: 5,
            tags: vec!["tag:a".into(), "tag:b".into()],
            directory: id.to_string(),
            time: 1_700_000_000_000,
            size: 4096,
            meta_json: "{}".into(),
            cover_path: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let db = open_memory().await.unwrap();
        assert!(!db.comic_exists("nhentai1").await.unwrap());
        db.upsert_comic(&sample("nhentai1")).await.unwrap();
        assert!(db.comic_exists("nhentai1").await.unwrap());
        let rec = db.get_comic("nhentai1").await.unwrap().unwrap();
        assert_eq!(rec.tags, vec!["tag:a", "tag:b"]);
        assert_eq!(rec.size, 4096);
    }

    #[tokio::test]
    async fn replace_overwrites_existing_row() {
        let db = open_memory().await.unwrap();
        db.upsert_comic(&sample("x")).await.unwrap();
        let mut second = sample("x");
        second.size = 1;
        second.title = "Replaced".into();
        db.upsert_comic(&second).await.unwrap();
        let rec = db.get_comic("x").await.unwrap().unwrap();
        assert_eq!(rec.title, "Replaced");
        assert_eq!(rec.size, 1);
    }
}
