//! Per-run log artifacts.
//!
//! Layout: `<root>/<address>/<YYYY-MM-DD>/<run start>.txt`, one file per run,
//! each line prefixed with the run start timestamp.

use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;

/// Day folder format.
pub const DAY_FORMAT: &str = "%Y-%m-%d";
/// Run start format, used for the file name and the line prefix.
pub const RUN_START_FORMAT: &str = "%Y-%m-%d %I-%M-%S-%p";

#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write log line: {0}")]
    Write(#[from] std::io::Error),
}

/// Replace everything but ASCII alphanumerics, `.` and `-` with `_`.
pub fn sanitize_address(address: &str) -> String {
    address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Creates the log artifact for each run.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    root: PathBuf,
}

impl SessionLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact for a run of `address` started at `started_at`.
    pub fn run_path(&self, address: &str, started_at: &DateTime<Local>) -> PathBuf {
        self.root
            .join(sanitize_address(address))
            .join(started_at.format(DAY_FORMAT).to_string())
            .join(format!("{}.txt", started_at.format(RUN_START_FORMAT)))
    }

    /// Open (creating folders as needed) the append-only artifact for a run.
    pub fn open_run(&self, address: &str, started_at: &DateTime<Local>) -> Result<RunLog, LogError> {
        let path = self.run_path(address, started_at);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| LogError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(RunLog {
            prefix: started_at.format(RUN_START_FORMAT).to_string(),
            path,
            writer: LineWriter::new(file),
        })
    }
}

/// Open artifact of one run.
#[derive(Debug)]
pub struct RunLog {
    prefix: String,
    path: PathBuf,
    writer: LineWriter<File>,
}

impl RunLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, line: &str) -> Result<(), LogError> {
        writeln!(self.writer, "{}: {}", self.prefix, line)?;
        Ok(())
    }
}
