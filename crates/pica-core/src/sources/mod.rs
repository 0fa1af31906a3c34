//! Upstream comic sources and the shared adapter contract.
//!
//! Each adapter consumes credentials, a target, optional episode selection,
//! a staging directory, a progress reporter, and a stop token; it produces a
//! populated staging layout plus a `DownloadedComic` record for commit. It
//! never writes outside the staging directory.

mod common;
mod ehentai;
mod hitomi;
mod htmanga;
mod jm;
mod nhentai;
mod picacg;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::fetch::Fetcher;
use crate::policy::FileJobPolicy;
use crate::progress::ProgressReporter;
use crate::retry::ArgError;
use crate::stop::StopToken;

/// The six upstream sources, in library-ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Picacg,
    Ehentai,
    Jm,
    Hitomi,
    Htmanga,
    Nhentai,
}

pub const ALL_SOURCES: [SourceKind; 6] = [
    SourceKind::Picacg,
    SourceKind::Ehentai,
    SourceKind::Jm,
    SourceKind::Hitomi,
    SourceKind::Htmanga,
    SourceKind::Nhentai,
];

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Picacg => "picacg",
            SourceKind::Ehentai => "ehentai",
            SourceKind::Jm => "jm",
            SourceKind::Hitomi => "hitomi",
            SourceKind::Htmanga => "htmanga",
            SourceKind::Nhentai => "nhentai",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "picacg" => Some(SourceKind::Picacg),
            "ehentai" => Some(SourceKind::Ehentai),
            "jm" => Some(SourceKind::Jm),
            "hitomi" => Some(SourceKind::Hitomi),
            "htmanga" => Some(SourceKind::Htmanga),
            "nhentai" => Some(SourceKind::Nhentai),
            _ => None,
        }
    }

    /// Ordinal stored in the library row.
    pub fn ordinal(self) -> i64 {
        match self {
            SourceKind::Picacg => 0,
            SourceKind::Ehentai => 1,
            SourceKind::Jm => 2,
            SourceKind::Hitomi => 3,
            SourceKind::Htmanga => 4,
            SourceKind::Nhentai => 5,
        }
    }

    /// Suffix used in the `PICA_FILE_*_{SOURCE}` environment knobs.
    pub fn env_suffix(self) -> &'static str {
        match self {
            SourceKind::Picacg => "PICACG",
            SourceKind::Ehentai => "EHENTAI",
            SourceKind::Jm => "JM",
            SourceKind::Hitomi => "HITOMI",
            SourceKind::Htmanga => "HTMANGA",
            SourceKind::Nhentai => "NHENTAI",
        }
    }
}

/// Adapter output: everything commit needs to publish the staging directory
/// as a library entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedComic {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub source: SourceKind,
    pub tags: Vec<String>,
    pub directory: String,
    /// Source-specific metadata preserved verbatim for clients.
    pub downloaded_json: serde_json::Value,
}

impl DownloadedComic {
    pub fn new(
        id: String,
        title: String,
        subtitle: String,
        source: SourceKind,
        tags: Vec<String>,
        downloaded_json: serde_json::Value,
    ) -> Self {
        let directory = safe_id(&id);
        Self {
            id,
            title,
            subtitle,
            source,
            tags,
            directory,
            downloaded_json,
        }
    }
}

/// Canonical library id for a `(source, target)` pair. Pure and stable:
/// the same pair always yields the same id.
pub fn canonical_id(source: SourceKind, target: &str) -> Result<String> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ArgError("empty target".into()).into());
    }
    let id = match source {
        SourceKind::Picacg => target.to_string(),
        SourceKind::Jm => format!("jm{}", digits_of(target)?),
        SourceKind::Hitomi => format!("hitomi{}", digits_of(target)?),
        SourceKind::Htmanga => format!("Ht{}", digits_of(target)?),
        SourceKind::Nhentai => format!("nhentai{}", digits_of(target)?),
        SourceKind::Ehentai => ehentai_gid(target)?,
    };
    Ok(id)
}

/// Extract the digit run from a numeric target or a link containing one.
fn digits_of(target: &str) -> Result<String> {
    let digits: String = target.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(ArgError(format!("no numeric id in target: {target}")).into());
    }
    Ok(digits)
}

/// Gallery id from an ehentai URL of the form `…/g/<gid>/<token>/…`.
fn ehentai_gid(target: &str) -> Result<String> {
    let mut parts = target.split('/').peekable();
    while let Some(part) = parts.next() {
        if part == "g" {
            if let Some(gid) = parts.peek() {
                if !gid.is_empty() && gid.chars().all(|c| c.is_ascii_digit()) {
                    return Ok(gid.to_string());
                }
            }
        }
    }
    Err(ArgError(format!("no /g/<gid>/ segment in gallery url: {target}")).into())
}

/// Filesystem-safe folder name: every character outside `[A-Za-z0-9._-]`
/// becomes `_`.
pub fn safe_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything an adapter run needs, owned by the worker for one task.
pub struct AdapterContext<'a> {
    /// Private staging directory of the task.
    pub work_dir: &'a Path,
    /// Stored credentials for the source; `Null` when none were pushed.
    pub auth: &'a serde_json::Value,
    pub target: &'a str,
    /// Zero-based display indices of the episodes to fetch; empty = all.
    pub eps: &'a [u32],
    pub progress: &'a ProgressReporter,
    pub stop: &'a StopToken,
    pub fetcher: &'a Fetcher,
    pub files: FileJobPolicy,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Download the comic into `ctx.work_dir` and return its record.
    /// Propagates `Stopped` unchanged; the first job error otherwise.
    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic>;
}

/// Dispatch table for the scheduler.
pub fn adapter_for(kind: SourceKind) -> &'static dyn Adapter {
    match kind {
        SourceKind::Picacg => &picacg::Picacg,
        SourceKind::Ehentai => &ehentai::Ehentai,
        SourceKind::Jm => &jm::Jm,
        SourceKind::Hitomi => &hitomi::Hitomi,
        SourceKind::Htmanga => &htmanga::Htmanga,
        SourceKind::Nhentai => &nhentai::Nhentai,
    }
}
