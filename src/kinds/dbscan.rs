//! Content-database scan tasks.
//!
//! A scan walks a content directory, matches files against the extension
//! lists of the databases under `db_root`, and appends `path|system` lines
//! to a playlist file. Databases are TOML documents with a `name` and an
//! `extensions` list.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    Payload, ScanSummary, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind, TaskOutcome,
    TaskReport, TaskSpec,
};

/// Files inspected per handler step.
const FILES_PER_STEP: usize = 32;

/// One content database: a system name plus the file extensions it claims.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentDatabase {
    pub name: String,
    pub extensions: Vec<String>,
}

/// Load every `*.toml` database under `db_root`. Unreadable or malformed
/// files are skipped with a warning.
fn load_databases(db_root: &Path) -> Vec<ContentDatabase> {
    let mut databases = Vec::new();
    for entry in WalkDir::new(db_root).max_depth(1).into_iter().flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Skipping unreadable database {:?}: {}", path, e);
                continue;
            }
        };
        match toml::from_str::<ContentDatabase>(&text) {
            Ok(db) => databases.push(db),
            Err(e) => warn!("Skipping malformed database {:?}: {}", path, e),
        }
    }
    databases
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

struct DbScanHandler {
    content_dir: PathBuf,
    playlist: PathBuf,
    recurse: bool,
    show_hidden: bool,
    databases: Vec<ContentDatabase>,
    walker: Option<Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>>,
    summary: ScanSummary,
}

fn match_database<'a>(databases: &'a [ContentDatabase], path: &Path) -> Option<&'a ContentDatabase> {
    let ext = path.extension()?.to_str()?;
    databases
        .iter()
        .find(|db| db.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

impl TaskHandler for DbScanHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if self.walker.is_none() {
            let mut walk = WalkDir::new(&self.content_dir);
            if !self.recurse {
                walk = walk.max_depth(1);
            }
            self.walker = Some(if self.show_hidden {
                Box::new(walk.into_iter())
            } else {
                Box::new(walk.into_iter().filter_entry(|entry| !is_hidden(entry)))
            });
            self.summary.playlist = self.playlist.clone();
            return Ok(StepOutcome::Pending);
        }

        let mut matched_lines = Vec::new();
        let mut exhausted = false;
        {
            let Some(walker) = self.walker.as_mut() else {
                return Err(TaskError::msg("scan stepped without an open walker"));
            };
            for _ in 0..FILES_PER_STEP {
                if ctx.is_cancel_requested() {
                    return Ok(StepOutcome::Cancelled);
                }
                let Some(entry) = walker.next() else {
                    exhausted = true;
                    break;
                };
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable path during scan: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                self.summary.files_scanned += 1;
                if let Some(db) = match_database(&self.databases, entry.path()) {
                    matched_lines.push(format!("{}|{}", entry.path().display(), db.name));
                }
            }
        }

        if !matched_lines.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.playlist)?;
            for line in &matched_lines {
                writeln!(file, "{line}")?;
            }
            self.summary.files_matched += matched_lines.len();
            ctx.add_bytes(matched_lines.iter().map(|l| l.len() as u64 + 1).sum());
        }

        if exhausted {
            return Ok(StepOutcome::Finished(TaskOutcome::DbScan(std::mem::take(
                &mut self.summary,
            ))));
        }
        Ok(StepOutcome::Pending)
    }
}

impl TaskEngine {
    /// Push a content-directory scan. Matches are appended to `playlist` as
    /// `path|system` lines.
    pub fn push_db_scan(
        &self,
        content_dir: &Path,
        db_root: &Path,
        playlist: &Path,
        recurse: bool,
        show_hidden: bool,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if !content_dir.is_dir() {
            return Err(PushError::SourceNotFound(content_dir.display().to_string()));
        }
        if !db_root.is_dir() {
            return Err(PushError::SourceNotFound(db_root.display().to_string()));
        }
        let databases = load_databases(db_root);
        if databases.is_empty() {
            return Err(PushError::InvalidArgument(format!(
                "no content databases under {}",
                db_root.display()
            )));
        }

        let handler = DbScanHandler {
            content_dir: content_dir.to_path_buf(),
            playlist: playlist.to_path_buf(),
            recurse,
            show_hidden,
            databases,
            walker: None,
            summary: ScanSummary::default(),
        };
        let title = format!("Scanning {}", content_dir.display());
        let id = self.submit(TaskSpec::new(TaskKind::DbScan, title, handler).callback(callback))?;
        debug!("Pushed database scan {} for {:?}", id, content_dir);
        Ok(id)
    }
}
