//! Logging init: file under the storage dir, or graceful fallback to stderr.

use anyhow::Result;
use std::fs;
use std::io;
use std::path::Path;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,pica_core=debug,pica_server=debug";

/// Hands out one handle to the log file per event. A failed handle clone
/// downgrades that event to stderr instead of dropping it.
struct LogFile(fs::File);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = Box<dyn io::Write>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.0.try_clone() {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::stderr()),
        }
    }
}

fn install(writer: BoxMakeWriter) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

/// Initialize structured logging to `<storage>/pica.log`. Returns Err when
/// the storage dir is unwritable so the caller can fall back to
/// `init_logging_stderr`.
pub fn init_logging(storage_dir: &Path) -> Result<()> {
    fs::create_dir_all(storage_dir)?;
    let log_path = storage_dir.join("pica.log");
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    install(BoxMakeWriter::new(LogFile(file)));
    tracing::info!("pica logging initialized at {}", log_path.display());
    Ok(())
}

/// Stderr-only logging for when the log file cannot be opened.
pub fn init_logging_stderr() {
    install(BoxMakeWriter::new(io::stderr));
}
