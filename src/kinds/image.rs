//! Image and overlay loading tasks.
//!
//! Reads image files in bounded chunks and sniffs their type from the bytes
//! rather than the file extension. Non-image files finalize the task as
//! errored. An overlay load reads a TOML descriptor naming the overlay and
//! its image layers, then loads each layer the same way.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use infer::MatcherType;
use serde::Deserialize;
use tracing::debug;

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    ImageData, OverlayData, Payload, Progress, StepOutcome, TaskContext, TaskHandler, TaskId,
    TaskKind, TaskOutcome, TaskReport, TaskSpec,
};

/// Bytes read from disk per handler step.
const CHUNK_SIZE: usize = 256 * 1024;

/// Sniff loaded bytes, rejecting anything that is not an image.
fn sniff_image(path: &Path, bytes: &[u8]) -> Result<String, TaskError> {
    let Some(kind) = infer::get(bytes) else {
        return Err(TaskError::msg(format!(
            "{} is not a recognized file type",
            path.display()
        )));
    };
    if kind.matcher_type() != MatcherType::Image {
        return Err(TaskError::msg(format!(
            "{} is not an image (detected {})",
            path.display(),
            kind.mime_type()
        )));
    }
    Ok(kind.mime_type().to_string())
}

struct ImageLoadHandler {
    path: PathBuf,
    file: Option<File>,
    total: u64,
    buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl TaskHandler for ImageLoadHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if self.file.is_none() {
            let file = File::open(&self.path)?;
            self.total = file.metadata()?.len();
            self.file = Some(file);
            ctx.set_progress(Progress::Indeterminate);
            return Ok(StepOutcome::Pending);
        }

        let Some(file) = self.file.as_mut() else {
            return Err(TaskError::msg("image load stepped after its file was consumed"));
        };
        let read = file.read(&mut self.scratch)?;
        if read > 0 {
            self.buf.extend_from_slice(&self.scratch[..read]);
            ctx.add_bytes(read as u64);
            if self.total > 0 {
                let pct = (self.buf.len() as u64 * 100 / self.total).min(100) as u8;
                ctx.set_progress(Progress::percent(pct));
            }
            return Ok(StepOutcome::Pending);
        }

        let mime = sniff_image(&self.path, &self.buf)?;
        ctx.set_progress(Progress::percent(100));
        Ok(StepOutcome::Finished(TaskOutcome::Image(ImageData {
            data: std::mem::take(&mut self.buf),
            mime,
        })))
    }
}

/// On-disk overlay descriptor: the overlay name plus its image layers,
/// relative to the descriptor's directory.
#[derive(Debug, Deserialize)]
struct OverlayDescriptor {
    name: String,
    images: Vec<PathBuf>,
}

struct OverlayLoadHandler {
    path: PathBuf,
    /// None until the descriptor has been parsed on the first step.
    remaining: Option<VecDeque<PathBuf>>,
    name: String,
    total_layers: usize,
    current: Option<(PathBuf, File)>,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    loaded: Vec<ImageData>,
}

impl OverlayLoadHandler {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            remaining: None,
            name: String::new(),
            total_layers: 0,
            current: None,
            buf: Vec::new(),
            scratch: vec![0u8; CHUNK_SIZE],
            loaded: Vec::new(),
        }
    }
}

impl TaskHandler for OverlayLoadHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if self.remaining.is_none() {
            let raw = std::fs::read_to_string(&self.path)?;
            let descriptor: OverlayDescriptor = toml::from_str(&raw).map_err(|e| {
                TaskError::msg(format!("malformed overlay {}: {e}", self.path.display()))
            })?;
            if descriptor.images.is_empty() {
                return Err(TaskError::msg(format!(
                    "overlay {} declares no images",
                    self.path.display()
                )));
            }
            let base = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
            self.name = descriptor.name;
            self.total_layers = descriptor.images.len();
            self.remaining = Some(
                descriptor
                    .images
                    .into_iter()
                    .map(|image| base.join(image))
                    .collect(),
            );
            ctx.set_progress(Progress::Indeterminate);
            return Ok(StepOutcome::Pending);
        }

        if let Some((path, file)) = self.current.as_mut() {
            let read = file.read(&mut self.scratch)?;
            if read > 0 {
                self.buf.extend_from_slice(&self.scratch[..read]);
                ctx.add_bytes(read as u64);
                return Ok(StepOutcome::Pending);
            }
            let mime = sniff_image(path, &self.buf)?;
            self.loaded.push(ImageData {
                data: std::mem::take(&mut self.buf),
                mime,
            });
            self.current = None;
            let pct = (self.loaded.len() * 100 / self.total_layers).min(100) as u8;
            ctx.set_progress(Progress::percent(pct));
            return Ok(StepOutcome::Pending);
        }

        let Some(next) = self.remaining.as_mut().and_then(VecDeque::pop_front) else {
            return Ok(StepOutcome::Finished(TaskOutcome::Overlay(OverlayData {
                name: std::mem::take(&mut self.name),
                images: std::mem::take(&mut self.loaded),
            })));
        };
        let file = File::open(&next)
            .map_err(|e| TaskError::msg(format!("overlay layer {}: {e}", next.display())))?;
        self.current = Some((next, file));
        Ok(StepOutcome::Pending)
    }
}

impl TaskEngine {
    /// Push an image load. The callback receives the raw bytes and the
    /// sniffed mime type.
    pub fn push_image_load(
        &self,
        path: &Path,
        mute: bool,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
        user_data: Payload,
    ) -> Result<TaskId, PushError> {
        if !path.is_file() {
            return Err(PushError::SourceNotFound(path.display().to_string()));
        }
        let handler = ImageLoadHandler {
            path: path.to_path_buf(),
            file: None,
            total: 0,
            buf: Vec::new(),
            scratch: vec![0u8; CHUNK_SIZE],
        };
        let title = format!("Loading {}", path.display());
        let id = self.submit(
            TaskSpec::new(TaskKind::ImageLoad, title, handler)
                .mute(mute)
                .callback(callback)
                .payload(user_data),
        )?;
        debug!("Pushed image load {} for {:?}", id, path);
        Ok(id)
    }

    /// Push an overlay load. The descriptor at `path` names the overlay and
    /// its image layers; the callback receives the overlay with every layer
    /// loaded and sniffed.
    pub fn push_overlay_load(
        &self,
        path: &Path,
        mute: bool,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
        user_data: Payload,
    ) -> Result<TaskId, PushError> {
        if !path.is_file() {
            return Err(PushError::SourceNotFound(path.display().to_string()));
        }
        let title = format!("Loading overlay {}", path.display());
        let id = self.submit(
            TaskSpec::new(TaskKind::ImageLoad, title, OverlayLoadHandler::new(path))
                .mute(mute)
                .callback(callback)
                .payload(user_data),
        )?;
        debug!("Pushed overlay load {} for {:?}", id, path);
        Ok(id)
    }
}
