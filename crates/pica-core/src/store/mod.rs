//! Durable library state: task rows, committed comics, upstream auth blobs.
//!
//! Single-process SQLite. All writes go through one pool; progress writes
//! are the dominant traffic and are rate-limited upstream by the progress
//! reporter.

mod auth;
mod comics;
mod db;
mod tasks;
mod types;

pub use db::{unix_millis, Library};
pub use types::{ComicRecord, TaskParams, TaskRecord, TaskStatus};

#[cfg(test)]
pub(crate) use db::open_memory;
