//! Screenshot capture tasks.
//!
//! Encodes a captured framebuffer to a 24-bit BMP file. The caller hands the
//! frame over at push time; the handler never touches the video stack.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::debug;

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    Payload, Progress, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind, TaskOutcome,
    TaskReport, TaskSpec,
};

/// A captured frame in row-major RGBA order, top row first.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

const BMP_HEADER_SIZE: u32 = 14 + 40;

/// Write `frame` as a bottom-up 24-bit BMP.
fn write_bmp(frame: &Framebuffer, out: &mut impl Write) -> std::io::Result<()> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let row_bytes = width * 3;
    let padding = (4 - row_bytes % 4) % 4;
    let image_size = ((row_bytes + padding) * height) as u32;
    let file_size = BMP_HEADER_SIZE + image_size;

    out.write_all(b"BM")?;
    out.write_all(&file_size.to_le_bytes())?;
    out.write_all(&[0u8; 4])?;
    out.write_all(&BMP_HEADER_SIZE.to_le_bytes())?;

    out.write_all(&40u32.to_le_bytes())?;
    out.write_all(&(frame.width as i32).to_le_bytes())?;
    out.write_all(&(frame.height as i32).to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&24u16.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;
    out.write_all(&image_size.to_le_bytes())?;
    // 2835 ppm is 72 dpi.
    out.write_all(&2835i32.to_le_bytes())?;
    out.write_all(&2835i32.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;

    let pad = [0u8; 3];
    for row in (0..height).rev() {
        let start = row * width * 4;
        for col in 0..width {
            let px = start + col * 4;
            // RGBA in, BGR out.
            out.write_all(&[
                frame.pixels[px + 2],
                frame.pixels[px + 1],
                frame.pixels[px],
            ])?;
        }
        out.write_all(&pad[..padding])?;
    }
    Ok(())
}

struct ScreenshotHandler {
    frame: Framebuffer,
    dest: PathBuf,
}

impl TaskHandler for ScreenshotHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if let Some(parent) = self.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.dest)?;
        let mut writer = BufWriter::new(file);
        write_bmp(&self.frame, &mut writer)?;
        writer.flush()?;
        ctx.set_progress(Progress::percent(100));
        debug!("Saved screenshot to {:?}", self.dest);
        Ok(StepOutcome::Finished(TaskOutcome::Screenshot(
            self.dest.clone(),
        )))
    }
}

/// Resolve where the screenshot lands. Absolute paths are used as given;
/// anything else goes under the configured screenshot directory with a
/// timestamped filename.
fn resolve_dest(
    path: &Path,
    is_absolute_path: bool,
    screenshot_dir: Option<&Path>,
) -> Result<PathBuf, PushError> {
    if is_absolute_path {
        if !path.is_absolute() {
            return Err(PushError::InvalidArgument(format!(
                "{} is not an absolute path",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }
    let Some(dir) = screenshot_dir else {
        return Err(PushError::TargetDirMissing(
            "no screenshot directory configured".to_string(),
        ));
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("screenshot");
    let name = format!("{}-{}.bmp", stem, Local::now().format("%y%m%d-%H%M%S"));
    Ok(dir.join(name))
}

impl TaskEngine {
    /// Push a screenshot capture.
    ///
    /// `silence` mutes the completion notification. `use_worker_hint` is
    /// advisory; the pump mode decides where the handler actually runs.
    #[allow(clippy::too_many_arguments)]
    pub fn push_screenshot(
        &self,
        path: &Path,
        silence: bool,
        has_framebuffer: bool,
        is_absolute_path: bool,
        use_worker_hint: bool,
        frame: Framebuffer,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if !has_framebuffer || frame.pixels.is_empty() {
            return Err(PushError::InvalidArgument(
                "no framebuffer to capture".to_string(),
            ));
        }
        if frame.pixels.len() != frame.expected_len() {
            return Err(PushError::InvalidArgument(format!(
                "framebuffer size mismatch: {}x{} needs {} bytes, got {}",
                frame.width,
                frame.height,
                frame.expected_len(),
                frame.pixels.len()
            )));
        }
        let dest = resolve_dest(
            path,
            is_absolute_path,
            self.config.screenshot_dir.as_deref(),
        )?;
        if use_worker_hint {
            debug!("Screenshot push requested worker execution");
        }

        let title = format!("Saving screenshot {}", dest.display());
        let handler = ScreenshotHandler { frame, dest };
        let id = self.submit(
            TaskSpec::new(TaskKind::Screenshot, title, handler)
                .mute(silence)
                .callback(callback),
        )?;
        debug!("Pushed screenshot {}", id);
        Ok(id)
    }
}
