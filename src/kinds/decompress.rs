//! Archive decompression tasks.
//!
//! `check_decompress` performs the same dry validation the push operation
//! runs (source exists and opens as an archive) without enqueueing anything;
//! `push_decompress` validates and enqueues the extraction task. The handler
//! extracts a bounded number of entries per step.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    DecompressSummary, Payload, Progress, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind,
    TaskOutcome, TaskReport, TaskSpec,
};

/// Entries extracted per handler step.
const ENTRIES_PER_STEP: usize = 8;

struct DecompressHandler {
    source: PathBuf,
    target_dir: PathBuf,
    /// Single-file mode: the first matching entry is written under this name
    /// and extraction stops.
    target_file: Option<String>,
    /// Only entries under this archive-relative directory are extracted.
    subdir: Option<String>,
    /// Lower-cased extension filter; empty means all entries.
    valid_exts: Vec<String>,
    archive: Option<ZipArchive<File>>,
    index: usize,
    summary: DecompressSummary,
}

fn entry_matches(subdir: Option<&str>, valid_exts: &[String], relative: &Path) -> bool {
    if let Some(subdir) = subdir {
        if !relative.starts_with(subdir) {
            return false;
        }
    }
    if valid_exts.is_empty() {
        return true;
    }
    relative
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| valid_exts.iter().any(|v| v.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

impl TaskHandler for DecompressHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if self.archive.is_none() {
            let file = File::open(&self.source)?;
            let archive = ZipArchive::new(file)
                .map_err(|e| TaskError::msg(format!("corrupt archive {:?}: {e}", self.source)))?;
            std::fs::create_dir_all(&self.target_dir)?;
            self.archive = Some(archive);
            return Ok(StepOutcome::Pending);
        }

        let Some(archive) = self.archive.as_mut() else {
            return Err(TaskError::msg("decompression stepped without an open archive"));
        };
        let total = archive.len();

        for _ in 0..ENTRIES_PER_STEP {
            if ctx.is_cancel_requested() {
                return Ok(StepOutcome::Cancelled);
            }
            if self.index >= total {
                ctx.set_progress(Progress::percent(100));
                return Ok(StepOutcome::Finished(TaskOutcome::Decompressed(
                    std::mem::take(&mut self.summary),
                )));
            }

            let idx = self.index;
            self.index += 1;
            if total > 0 {
                ctx.set_progress(Progress::percent((idx * 100 / total) as u8));
            }

            let mut entry = archive
                .by_index(idx)
                .map_err(|e| TaskError::msg(format!("failed to read archive entry {idx}: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            // Reject entries that would escape the target directory.
            let Some(relative) = entry.enclosed_name() else {
                debug!("Skipping archive entry with unsafe path: {}", entry.name());
                continue;
            };
            if !entry_matches(self.subdir.as_deref(), &self.valid_exts, &relative) {
                continue;
            }

            let dest = match &self.target_file {
                Some(name) => self.target_dir.join(name),
                None => self.target_dir.join(&relative),
            };
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let entry_name = entry.name().to_string();
            let mut out = File::create(&dest)?;
            let written = io::copy(&mut entry, &mut out)?;
            self.summary.entries.push(entry_name);
            self.summary.bytes_written += written;
            ctx.add_bytes(written);

            if self.target_file.is_some() {
                // Single-file mode: done after the first extracted entry.
                ctx.set_progress(Progress::percent(100));
                return Ok(StepOutcome::Finished(TaskOutcome::Decompressed(
                    std::mem::take(&mut self.summary),
                )));
            }
        }
        Ok(StepOutcome::Pending)
    }
}

/// Validate that `source` exists and opens as a zip archive.
fn validate_source(source: &Path) -> Result<(), PushError> {
    if !source.is_file() {
        return Err(PushError::SourceNotFound(source.display().to_string()));
    }
    let file = File::open(source)
        .map_err(|e| PushError::InvalidArgument(format!("cannot open {source:?}: {e}")))?;
    ZipArchive::new(file)
        .map_err(|e| PushError::InvalidArgument(format!("{source:?} is not a valid archive: {e}")))?;
    Ok(())
}

impl TaskEngine {
    /// Dry validation for a decompression push: checks the source without
    /// enqueueing a task.
    pub fn check_decompress(&self, source: &Path) -> Result<(), PushError> {
        validate_source(source)
    }

    /// Push an archive extraction task.
    ///
    /// `target_file` switches to single-file mode: only the first entry
    /// passing the filters is extracted, under that name. `valid_ext` is a
    /// pipe-separated extension list (e.g. `"bin|rom"`).
    #[allow(clippy::too_many_arguments)]
    pub fn push_decompress(
        &self,
        source: &Path,
        target_dir: &Path,
        target_file: Option<&str>,
        subdir: Option<&str>,
        valid_ext: Option<&str>,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
        user_data: Payload,
    ) -> Result<TaskId, PushError> {
        validate_source(source)?;
        if target_dir.as_os_str().is_empty() {
            return Err(PushError::InvalidArgument("empty target directory".to_string()));
        }
        if target_dir.is_file() {
            return Err(PushError::TargetDirMissing(format!(
                "{} is a file",
                target_dir.display()
            )));
        }

        let valid_exts = valid_ext
            .map(|s| {
                s.split('|')
                    .filter(|e| !e.is_empty())
                    .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let handler = DecompressHandler {
            source: source.to_path_buf(),
            target_dir: target_dir.to_path_buf(),
            target_file: target_file.map(str::to_string),
            subdir: subdir.map(str::to_string),
            valid_exts,
            archive: None,
            index: 0,
            summary: DecompressSummary::default(),
        };

        let title = format!("Extracting {}", source.display());
        let id = self.submit(
            TaskSpec::new(TaskKind::Decompress, title, handler)
                .callback(callback)
                .payload(user_data),
        )?;
        debug!("Pushed decompression {} for {:?}", id, source);
        Ok(id)
    }
}
