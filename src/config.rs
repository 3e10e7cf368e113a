//! Configuration module for multiping.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::{DEFAULT_HISTORY_LINES, DEFAULT_STOP_GRACE};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Root folder of the per-run log files (default: "ip logs")
    pub log_dir: PathBuf,
    /// Preset store file (default: "presets.json")
    pub preset_file: PathBuf,
    /// Time a probe gets to release its resource after stop (default: 2s)
    pub stop_grace: Duration,
    /// Raw lines kept per session for display (default: 50)
    pub history_lines: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("ip logs"),
            preset_file: PathBuf::from("presets.json"),
            stop_grace: DEFAULT_STOP_GRACE,
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MULTIPING_LOG_DIR`: log root (default: "ip logs")
    /// - `MULTIPING_PRESET_FILE`: preset store (default: "presets.json")
    /// - `MULTIPING_STOP_GRACE_MS`: stop grace period in ms (default: 2000)
    /// - `MULTIPING_HISTORY_LINES`: retained lines per session (default: 50)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("MULTIPING_LOG_DIR").filter(|d| !d.is_empty()) {
            cfg.log_dir = PathBuf::from(dir);
        }

        if let Some(file) = lookup("MULTIPING_PRESET_FILE").filter(|f| !f.is_empty()) {
            cfg.preset_file = PathBuf::from(file);
        }

        if let Some(grace) = lookup("MULTIPING_STOP_GRACE_MS") {
            match grace.parse() {
                Ok(ms) => cfg.stop_grace = Duration::from_millis(ms),
                Err(_) => tracing::warn!("Ignoring invalid MULTIPING_STOP_GRACE_MS: {}", grace),
            }
        }

        if let Some(lines) = lookup("MULTIPING_HISTORY_LINES") {
            match lines.parse() {
                Ok(n) => cfg.history_lines = n,
                Err(_) => tracing::warn!("Ignoring invalid MULTIPING_HISTORY_LINES: {}", lines),
            }
        }

        cfg
    }
}
