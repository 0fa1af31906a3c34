//! Helpers shared by the source adapters: auth access, extension
//! derivation, resume bookkeeping, and the common page-job runner.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::AdapterContext;
use crate::fanout;
use crate::retry::{ArgError, RetryPolicy};
use crate::stop::Stopped;

/// Lowercase hex of a digest or nonce.
pub fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Required string key from the stored auth payload.
pub fn required_str<'a>(auth: &'a Value, key: &str) -> Result<&'a str> {
    auth.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ArgError(format!("missing auth.{key}")).into())
}

pub fn optional_str<'a>(auth: &'a Value, key: &str) -> Option<&'a str> {
    auth.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// File extension from a URL path, defaulting to `jpg` when the path has
/// none or it looks bogus.
pub fn ext_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "jpg".to_string(),
    }
}

pub fn file_nonempty(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// True when a non-empty `<page_no>.<ext>` already sits in `dir`, whatever
/// the extension. This is what makes a kept staging directory resumable.
pub fn page_file_exists(dir: &Path, page_no: u32) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let stem = page_no.to_string();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((file_stem, _)) = name.rsplit_once('.') else {
            continue;
        };
        if file_stem == stem
            && entry
                .metadata()
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Completed work units already present in a staging directory: the cover
/// plus every non-empty file under `pages/`, recursively.
pub fn count_downloaded(work_dir: &Path) -> i64 {
    let mut count = 0i64;
    if file_nonempty(&work_dir.join("cover.jpg")) {
        count += 1;
    }
    let mut stack = vec![work_dir.join("pages")];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.len() > 0 {
                count += 1;
            }
        }
    }
    count
}

/// One file download within a task: candidate URLs tried in order (the
/// fallback exists for hitomi's webp-first scheme), a destination, and
/// request headers.
#[derive(Debug, Clone)]
pub struct PageJob {
    pub urls: Vec<String>,
    pub dst: PathBuf,
    pub headers: HashMap<String, String>,
}

impl PageJob {
    pub fn new(url: String, dst: PathBuf, headers: HashMap<String, String>) -> Self {
        Self {
            urls: vec![url],
            dst,
            headers,
        }
    }
}

/// Run the task's page jobs through the bounded fan-out. Jobs whose
/// destination is already non-empty skip themselves without advancing
/// progress (the resume floor already counted them); each fresh file
/// advances progress by one after its bytes are fully on disk.
pub async fn run_page_jobs(
    ctx: &AdapterContext<'_>,
    jobs: Vec<PageJob>,
    timeout: Duration,
) -> Result<()> {
    let policy = RetryPolicy::with_retries(ctx.files.retries);
    fanout::for_each_concurrent(jobs, ctx.files.concurrent, ctx.stop, || {}, |job| {
        let policy = policy;
        async move {
            if file_nonempty(&job.dst) {
                return Ok(());
            }
            if let Some(parent) = job.dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut last_err: Option<anyhow::Error> = None;
            for url in &job.urls {
                match ctx
                    .fetcher
                    .download_to_file(
                        url,
                        &job.dst,
                        &job.headers,
                        timeout,
                        None,
                        &policy,
                        ctx.stop,
                    )
                    .await
                {
                    Ok(()) => {
                        ctx.progress.advance(1).await?;
                        return Ok(());
                    }
                    Err(e) if e.downcast_ref::<Stopped>().is_some() => return Err(e),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err
                .unwrap_or_else(|| anyhow::anyhow!("page job had no candidate urls")))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_from_url_handles_queries_and_junk() {
        assert_eq!(ext_from_url("https://h/x/1.webp?token=abc"), "webp");
        assert_eq!(ext_from_url("https://h/x/archive.JPG"), "jpg");
        assert_eq!(ext_from_url("https://h/x/noext"), "jpg");
        assert_eq!(ext_from_url("https://h/x/weird.tar.gz"), "gz");
        assert_eq!(ext_from_url("https://h/x/page.what-is-this"), "jpg");
    }

    #[test]
    fn page_file_exists_ignores_empty_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!page_file_exists(tmp.path(), 1));
        std::fs::write(tmp.path().join("1.jpg"), b"").unwrap();
        assert!(!page_file_exists(tmp.path(), 1));
        std::fs::write(tmp.path().join("1.jpg"), b"data").unwrap();
        assert!(page_file_exists(tmp.path(), 1));
        // Different extension still counts for the same page number.
        std::fs::write(tmp.path().join("2.png"), b"data").unwrap();
        assert!(page_file_exists(tmp.path(), 2));
        assert!(!page_file_exists(tmp.path(), 3));
    }

    #[test]
    fn count_downloaded_walks_chapter_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let pages = tmp.path().join("pages");
        std::fs::create_dir_all(pages.join("1")).unwrap();
        std::fs::create_dir_all(pages.join("2")).unwrap();
        std::fs::write(pages.join("1").join("1.jpg"), b"a").unwrap();
        std::fs::write(pages.join("1").join("2.jpg"), b"b").unwrap();
        std::fs::write(pages.join("2").join("1.jpg"), b"c").unwrap();
        std::fs::write(pages.join("2").join("empty.jpg"), b"").unwrap();
        assert_eq!(count_downloaded(tmp.path()), 3);
        std::fs::write(tmp.path().join("cover.jpg"), b"cover").unwrap();
        assert_eq!(count_downloaded(tmp.path()), 4);
    }

    #[test]
    fn missing_auth_key_is_an_argument_error() {
        let auth = serde_json::json!({"cookie": "  "});
        let err = required_str(&auth, "cookie").unwrap_err();
        let arg = err.downcast_ref::<ArgError>().unwrap();
        assert_eq!(arg.to_string(), "missing auth.cookie");
    }
}
