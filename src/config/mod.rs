//! Engine configuration.
//!
//! Resolved once at engine construction: callers either build an
//! [`EngineConfig`] in code or load a TOML [`FileConfig`] and merge it over
//! the defaults. The scheduling model is part of the configuration and
//! applies to the whole engine, never per task.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pump::PumpMode;

/// Default number of worker threads in threaded mode.
const DEFAULT_WORKERS: usize = 4;
/// Default handler steps per task per cooperative tick.
const DEFAULT_STEPS_PER_TICK: usize = 1;
/// Default HTTP timeout for transfers and lobby queries.
const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 30;

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduling model for the whole engine.
    pub mode: PumpMode,
    /// Handler steps per task per tick (cooperative mode only).
    pub steps_per_tick: usize,
    /// Timeout applied to HTTP requests issued by task handlers.
    pub http_timeout: Duration,
    /// Base URL of the discovery lobby (room listing, compatibility scans).
    pub lobby_url: Option<String>,
    /// Directory of device autoconfiguration profiles (TOML, one per file).
    pub autoconfig_dir: Option<PathBuf>,
    /// Input driver identifiers the autoconfig handler accepts.
    pub known_input_drivers: Vec<String>,
    /// Directory screenshots land in when the caller passes a relative name.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: PumpMode::Cooperative,
            steps_per_tick: DEFAULT_STEPS_PER_TICK,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SEC),
            lobby_url: None,
            autoconfig_dir: None,
            known_input_drivers: default_input_drivers(),
            screenshot_dir: None,
        }
    }
}

impl EngineConfig {
    /// Convenience constructor for threaded mode.
    pub fn threaded(workers: usize) -> Self {
        Self {
            mode: PumpMode::Threaded {
                workers: workers.max(1),
            },
            ..Self::default()
        }
    }

    /// Merge a TOML file config over the defaults. File values win.
    pub fn resolve(file: FileConfig) -> Result<Self> {
        let defaults = Self::default();

        let mode = match file.mode.as_deref() {
            None | Some("cooperative") => PumpMode::Cooperative,
            Some("threaded") => PumpMode::Threaded {
                workers: file.workers.unwrap_or(DEFAULT_WORKERS).max(1),
            },
            Some(other) => anyhow::bail!("unknown pump mode '{other}'"),
        };

        Ok(Self {
            mode,
            steps_per_tick: file.steps_per_tick.unwrap_or(defaults.steps_per_tick).max(1),
            http_timeout: file
                .http_timeout_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            lobby_url: file.lobby_url,
            autoconfig_dir: file.autoconfig_dir.map(PathBuf::from),
            known_input_drivers: file
                .known_input_drivers
                .unwrap_or_else(default_input_drivers),
            screenshot_dir: file.screenshot_dir.map(PathBuf::from),
        })
    }

    /// Load and resolve a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        let file: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {path:?}"))?;
        Self::resolve(file)
    }
}

fn default_input_drivers() -> Vec<String> {
    ["udev", "sdl2", "xinput", "null"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Raw TOML configuration; every field optional so partial files work.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// "cooperative" or "threaded".
    pub mode: Option<String>,
    pub workers: Option<usize>,
    pub steps_per_tick: Option<usize>,
    pub http_timeout_sec: Option<u64>,
    pub lobby_url: Option<String>,
    pub autoconfig_dir: Option<String>,
    pub known_input_drivers: Option<Vec<String>>,
    pub screenshot_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_cooperative_single_step() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, PumpMode::Cooperative);
        assert_eq!(config.steps_per_tick, 1);
        assert!(config.lobby_url.is_none());
    }

    #[test]
    fn resolve_threaded_mode_from_file() {
        let file: FileConfig = toml::from_str(
            r#"
            mode = "threaded"
            workers = 2
            http_timeout_sec = 5
            lobby_url = "http://lobby.example"
            "#,
        )
        .unwrap();

        let config = EngineConfig::resolve(file).unwrap();
        assert_eq!(config.mode, PumpMode::Threaded { workers: 2 });
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.lobby_url.as_deref(), Some("http://lobby.example"));
    }

    #[test]
    fn resolve_rejects_unknown_mode() {
        let file = FileConfig {
            mode: Some("fibers".to_string()),
            ..Default::default()
        };
        assert!(EngineConfig::resolve(file).is_err());
    }

    #[test]
    fn worker_count_is_never_zero() {
        let file = FileConfig {
            mode: Some("threaded".to_string()),
            workers: Some(0),
            ..Default::default()
        };
        let config = EngineConfig::resolve(file).unwrap();
        assert_eq!(config.mode, PumpMode::Threaded { workers: 1 });
    }
}
