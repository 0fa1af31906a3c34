//! Boot-time retry and concurrency policy.
//!
//! An immutable record built once from the environment and passed to the
//! scheduler. The control plane mutates it only by swapping the whole record
//! behind the scheduler's lock.

use std::collections::HashMap;

use crate::sources::{SourceKind, ALL_SOURCES};

/// Clamp range for per-task file-download concurrency.
pub const FILE_CONCURRENT_RANGE: (usize, usize) = (1, 16);
/// Clamp range for the task worker ceiling.
pub const MAX_CONCURRENT_RANGE: (usize, usize) = (1, 20);

/// Per-file-job slice of the policy handed to one adapter invocation.
#[derive(Debug, Clone, Copy)]
pub struct FileJobPolicy {
    /// Additional attempts after the first, per file.
    pub retries: u32,
    /// Concurrent file downloads within the task.
    pub concurrent: usize,
}

/// Process-wide policy record.
#[derive(Debug, Clone)]
pub struct Policy {
    pub file_retries_default: u32,
    pub file_retries_by_source: HashMap<SourceKind, u32>,
    pub file_concurrent_default: usize,
    pub file_concurrent_by_source: HashMap<SourceKind, usize>,
    /// Scheduler worker ceiling.
    pub max_concurrent: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            file_retries_default: 2,
            file_retries_by_source: HashMap::new(),
            file_concurrent_default: 6,
            file_concurrent_by_source: HashMap::new(),
            max_concurrent: 2,
        }
    }
}

fn clamp(v: usize, range: (usize, usize)) -> usize {
    v.clamp(range.0, range.1)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Policy {
    /// Build the policy from the `PICA_*` environment knobs, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut policy = Policy::default();
        if let Some(v) = env_parse::<u32>("PICA_FILE_RETRIES_DEFAULT") {
            policy.file_retries_default = v;
        }
        if let Some(v) = env_parse::<usize>("PICA_FILE_CONCURRENT_DEFAULT") {
            policy.file_concurrent_default = clamp(v, FILE_CONCURRENT_RANGE);
        }
        if let Some(v) = env_parse::<usize>("PICA_MAX_CONCURRENT") {
            policy.max_concurrent = clamp(v, MAX_CONCURRENT_RANGE);
        }
        for source in ALL_SOURCES {
            let retries_key = format!("PICA_FILE_RETRIES_{}", source.env_suffix());
            if let Some(v) = env_parse::<u32>(&retries_key) {
                policy.file_retries_by_source.insert(source, v);
            }
            let concurrent_key = format!("PICA_FILE_CONCURRENT_{}", source.env_suffix());
            if let Some(v) = env_parse::<usize>(&concurrent_key) {
                policy
                    .file_concurrent_by_source
                    .insert(source, clamp(v, FILE_CONCURRENT_RANGE));
            }
        }
        policy
    }

    /// Retry budget for one file of the given source.
    pub fn file_retries(&self, source: SourceKind) -> u32 {
        self.file_retries_by_source
            .get(&source)
            .copied()
            .unwrap_or(self.file_retries_default)
    }

    /// File-download concurrency for the given source, clamped to [1, 16].
    pub fn file_concurrent(&self, source: SourceKind) -> usize {
        let v = self
            .file_concurrent_by_source
            .get(&source)
            .copied()
            .unwrap_or(self.file_concurrent_default);
        clamp(v, FILE_CONCURRENT_RANGE)
    }

    pub fn file_job_policy(&self, source: SourceKind) -> FileJobPolicy {
        FileJobPolicy {
            retries: self.file_retries(source),
            concurrent: self.file_concurrent(source),
        }
    }

    /// New record with the runtime-mutable fields replaced; everything else
    /// is carried over.
    pub fn with_updates(
        &self,
        max_concurrent: Option<usize>,
        file_concurrent_default: Option<usize>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(v) = max_concurrent {
            next.max_concurrent = clamp(v, MAX_CONCURRENT_RANGE);
        }
        if let Some(v) = file_concurrent_default {
            next.file_concurrent_default = clamp(v, FILE_CONCURRENT_RANGE);
        }
        next
    }
}
