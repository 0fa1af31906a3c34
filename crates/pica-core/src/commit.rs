//! Publish a finished staging directory as a library entry.
//!
//! The commit point is rename-then-insert: rename the task's staging
//! directory to the comic directory, then INSERT OR REPLACE the library row.
//! A crash between the two leaves an inert directory (invisible to clients
//! until a row exists) that the next commit for the same id overwrites.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::sources::DownloadedComic;
use crate::store::{unix_millis, ComicRecord, Library};

/// Staging root under the storage directory.
pub const TASKS_DIR: &str = "tasks";
/// Committed library root under the storage directory.
pub const COMICS_DIR: &str = "comics";

/// A task's private staging directory.
pub fn staging_dir(storage: &Path, task_id: &str) -> PathBuf {
    storage.join(TASKS_DIR).join(task_id)
}

/// The committed directory for a comic's filesystem-safe id.
pub fn comic_dir(storage: &Path, directory: &str) -> PathBuf {
    storage.join(COMICS_DIR).join(directory)
}

/// Move `staging` into the library and insert the row. An existing
/// destination (orphan of a crashed commit, or a forced overwrite) is
/// deleted first so the rename lands cleanly.
pub async fn commit(
    db: &Library,
    storage: &Path,
    staging: &Path,
    comic: &DownloadedComic,
) -> Result<ComicRecord> {
    let dest = comic_dir(storage, &comic.directory);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    if tokio::fs::metadata(&dest).await.is_ok() {
        tokio::fs::remove_dir_all(&dest)
            .await
            .with_context(|| format!("clear stale comic dir {}", dest.display()))?;
    }
    tokio::fs::rename(staging, &dest)
        .await
        .with_context(|| format!("publish {} -> {}", staging.display(), dest.display()))?;

    let size = dir_size(dest.join("pages")).await?;
    let cover_path = pick_cover(&dest).await;
    let rec = ComicRecord {
        id: comic.id.clone(),
        title: comic.title.clone(),
        subtitle: comic.subtitle.clone(),
        source: comic.source.ordinal(),
        tags: comic.tags.clone(),
        directory: comic.directory.clone(),
        time: unix_millis(),
        size,
        meta_json: serde_json::to_string(comic)?,
        cover_path: cover_path.map(|p| p.to_string_lossy().into_owned()),
    };
    db.upsert_comic(&rec).await?;
    tracing::info!(comic = %rec.id, size = rec.size, "committed to library");
    Ok(rec)
}

/// Prefer `<dir>/cover.jpg`, fall back to `<dir>/pages/cover.jpg`.
async fn pick_cover(dir: &Path) -> Option<PathBuf> {
    for candidate in [dir.join("cover.jpg"), dir.join("pages").join("cover.jpg")] {
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    None
}

/// Sum of file lengths under `dir`, recursively. 0 if the directory does
/// not exist.
async fn dir_size(dir: PathBuf) -> Result<i64> {
    let mut total = 0i64;
    let mut stack = vec![dir];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("read dir {}", current.display()));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("iterate {}", current.display()))?
        {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len() as i64;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use crate::store::open_memory;

    fn sample_comic(id: &str) -> DownloadedComic {
        DownloadedComic::new(
            id.to_string(),
            "Title".into(),
            "".into(),
            SourceKind::Nhentai,
            vec!["tag".into()],
            serde_json::json!({"media_id": "1"}),
        )
    }

    async fn make_staging(storage: &Path, task_id: &str, with_cover: bool) -> PathBuf {
        let staging = staging_dir(storage, task_id);
        tokio::fs::create_dir_all(staging.join("pages"))
            .await
            .unwrap();
        tokio::fs::write(staging.join("pages").join("1.jpg"), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::write(staging.join("pages").join("2.png"), vec![0u8; 50])
            .await
            .unwrap();
        if with_cover {
            tokio::fs::write(staging.join("cover.jpg"), vec![0u8; 10])
                .await
                .unwrap();
        }
        staging
    }

    #[tokio::test]
    async fn commit_moves_staging_and_inserts_row() {
        let db = open_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path();
        let staging = make_staging(storage, "t1", true).await;

        let comic = sample_comic("nhentai1");
        let rec = commit(&db, storage, &staging, &comic).await.unwrap();

        assert!(!staging.exists());
        let dest = comic_dir(storage, "nhentai1");
        assert!(dest.join("pages").join("1.jpg").exists());
        // Size counts pages/ only, not the cover.
        assert_eq!(rec.size, 150);
        assert!(rec.cover_path.as_deref().unwrap().ends_with("cover.jpg"));
        assert!(db.comic_exists("nhentai1").await.unwrap());
    }

    #[tokio::test]
    async fn commit_falls_back_to_pages_cover() {
        let db = open_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path();
        let staging = make_staging(storage, "t2", false).await;
        tokio::fs::write(staging.join("pages").join("cover.jpg"), vec![1u8; 5])
            .await
            .unwrap();

        let rec = commit(&db, storage, &staging, &sample_comic("nhentai2"))
            .await
            .unwrap();
        let cover = rec.cover_path.unwrap();
        assert!(cover.contains("pages"));
    }

    #[tokio::test]
    async fn commit_overwrites_orphan_destination() {
        let db = open_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path();

        // Orphan left by a commit that died before its row insert.
        let orphan = comic_dir(storage, "nhentai3");
        tokio::fs::create_dir_all(orphan.join("pages")).await.unwrap();
        tokio::fs::write(orphan.join("pages").join("stale.jpg"), b"old")
            .await
            .unwrap();

        let staging = make_staging(storage, "t3", true).await;
        commit(&db, storage, &staging, &sample_comic("nhentai3"))
            .await
            .unwrap();

        let dest = comic_dir(storage, "nhentai3");
        assert!(dest.join("pages").join("1.jpg").exists());
        assert!(!dest.join("pages").join("stale.jpg").exists());
    }
}
