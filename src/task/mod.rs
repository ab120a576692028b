//! Task model: identity, kind, lifecycle state, progress, payload ownership
//! and the handler contract that task bodies implement.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Opaque task identity, unique for the lifetime of the engine that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which kind of background work a task performs.
///
/// The kind tags which push operation created the task; the retriever layer
/// filters on it for progress aggregation and bulk cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    HttpTransfer,
    Decompress,
    DbScan,
    ImageLoad,
    Autoconfig,
    Discovery,
    Screenshot,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::HttpTransfer => "http_transfer",
            TaskKind::Decompress => "decompress",
            TaskKind::DbScan => "db_scan",
            TaskKind::ImageLoad => "image_load",
            TaskKind::Autoconfig => "autoconfig",
            TaskKind::Discovery => "discovery",
            TaskKind::Screenshot => "screenshot",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Queued -> Running -> {Finished, Cancelled,
/// Errored}`. Terminal states never transition again; the queue asserts this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Cancelled,
    Errored,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Cancelled | TaskState::Errored
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Cancelled => "cancelled",
            TaskState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Task progress, as reported by the handler while the task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Progress {
    Indeterminate,
    Percent(u8),
}

impl Progress {
    /// Build a percentage progress value, clamped to 0-100.
    pub fn percent(value: u8) -> Self {
        Progress::Percent(value.min(100))
    }
}

/// Live counters shared between a running handler and queue snapshots.
///
/// Progress is encoded as -1 for indeterminate, 0-100 for a percentage, so
/// snapshots can read it without taking the queue lock mid-step.
#[derive(Debug)]
pub struct LiveStats {
    progress: AtomicI16,
    bytes: AtomicU64,
}

impl LiveStats {
    pub(crate) fn new() -> Self {
        Self {
            progress: AtomicI16::new(-1),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn progress(&self) -> Progress {
        match self.progress.load(Ordering::Relaxed) {
            p if p < 0 => Progress::Indeterminate,
            p => Progress::Percent(p.min(100) as u8),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn set_progress(&self, progress: Progress) {
        let encoded = match progress {
            Progress::Indeterminate => -1,
            Progress::Percent(p) => i16::from(p.min(100)),
        };
        self.progress.store(encoded, Ordering::Relaxed);
    }

    fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }

    fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Per-step context handed to a task handler.
///
/// Exposes the cancel flag and the live progress counters. Handlers must
/// check [`TaskContext::is_cancel_requested`] at safe checkpoints and return
/// [`StepOutcome::Cancelled`] promptly when it is set.
pub struct TaskContext {
    cancel: CancellationToken,
    stats: Arc<LiveStats>,
}

impl TaskContext {
    pub(crate) fn new(cancel: CancellationToken, stats: Arc<LiveStats>) -> Self {
        Self { cancel, stats }
    }

    /// True once any caller has requested cancellation. Never reverses.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle on the cancel flag for I/O helper threads spawned by a handler.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_progress(&self, progress: Progress) {
        self.stats.set_progress(progress);
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.stats.set_bytes(bytes);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.stats.add_bytes(bytes);
    }
}

/// Result of a single handler step.
#[derive(Debug)]
pub enum StepOutcome {
    /// More work remains; the pump will step the handler again.
    Pending,
    /// The handler observed the cancel flag and stopped early.
    Cancelled,
    /// The task completed with the given kind-specific outcome.
    Finished(TaskOutcome),
}

/// Kind-specific body of a task.
///
/// In cooperative mode the pump invokes `step` once per tick with a bounded
/// amount of work expected per call; in threaded mode a worker loops `step`
/// to completion and the handler may block on I/O inside a step.
pub trait TaskHandler: Send {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError>;
}

impl<F> TaskHandler for F
where
    F: FnMut(&TaskContext) -> Result<StepOutcome, TaskError> + Send,
{
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        self(ctx)
    }
}

/// Opaque caller data attached to a task, with explicit ownership.
///
/// `Owned` payloads are dropped exactly once at finalization (they move into
/// the completion callback, and are released when it returns). `Borrowed`
/// payloads are shared with the caller; the engine never runs their cleanup.
pub enum Payload {
    None,
    Owned(Box<dyn Any + Send>),
    Borrowed(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    pub fn owned<T: Any + Send>(value: T) -> Self {
        Payload::Owned(Box::new(value))
    }

    pub fn borrowed<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Payload::Borrowed(value)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    /// Downcast a reference to the payload value, whichever way it is owned.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::None => None,
            Payload::Owned(boxed) => boxed.downcast_ref::<T>(),
            Payload::Borrowed(shared) => shared.downcast_ref::<T>(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => f.write_str("Payload::None"),
            Payload::Owned(_) => f.write_str("Payload::Owned(..)"),
            Payload::Borrowed(_) => f.write_str("Payload::Borrowed(..)"),
        }
    }
}

/// Result buffer of a network transfer. Ownership moves to the callback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferData {
    pub data: Vec<u8>,
}

impl TransferData {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Accounting for a finished decompression task.
#[derive(Debug, Default, Clone)]
pub struct DecompressSummary {
    /// Archive-relative names of the entries that were extracted.
    pub entries: Vec<String>,
    /// Total bytes written to the target directory.
    pub bytes_written: u64,
}

/// Accounting for a finished content-database scan.
#[derive(Debug, Default, Clone)]
pub struct ScanSummary {
    pub files_scanned: usize,
    pub files_matched: usize,
    pub playlist: PathBuf,
}

/// A loaded image: raw bytes plus the sniffed mime type.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub mime: String,
}

/// A peer discovered by a network scan or room listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub core: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub content_crc: Option<u32>,
}

/// A wireless network reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    #[serde(default)]
    pub connected: bool,
    /// Signal strength in percent, when the backend reports one.
    #[serde(default)]
    pub signal: Option<u8>,
}

/// An input overlay: its declared name plus the loaded image layers.
#[derive(Debug, Clone)]
pub struct OverlayData {
    pub name: String,
    pub images: Vec<ImageData>,
}

/// Outcome of a device autoconfiguration task.
#[derive(Debug, Clone)]
pub struct AutoconfigResult {
    pub port: usize,
    pub configured: bool,
    /// Name of the matched profile, when one was found.
    pub profile: Option<String>,
}

/// Kind-specific result value delivered to the completion callback.
#[derive(Debug)]
pub enum TaskOutcome {
    None,
    Transfer(TransferData),
    Decompressed(DecompressSummary),
    DbScan(ScanSummary),
    Image(ImageData),
    Autoconfig(AutoconfigResult),
    Peers(Vec<PeerInfo>),
    WifiNetworks(Vec<WifiNetwork>),
    NatTraversal(bool),
    Screenshot(PathBuf),
    Overlay(OverlayData),
}

/// Completion report handed to the callback, exactly once, after the task
/// reached a terminal state.
#[derive(Debug)]
pub struct TaskReport {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub title: String,
    /// When set, UI layers should not surface a completion notification.
    pub mute: bool,
    /// Populated only when `state` is `Errored`.
    pub error: Option<String>,
    pub outcome: TaskOutcome,
}

/// Completion callback type. Invoked on the main-loop thread.
pub type TaskCallback = Box<dyn FnOnce(TaskReport, Payload) + Send>;

/// Everything needed to enqueue one task.
pub struct TaskSpec {
    pub(crate) kind: TaskKind,
    pub(crate) title: String,
    pub(crate) mute: bool,
    pub(crate) handler: Box<dyn TaskHandler>,
    pub(crate) callback: Option<TaskCallback>,
    pub(crate) payload: Payload,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, title: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            kind,
            title: title.into(),
            mute: false,
            handler: Box::new(handler),
            callback: None,
            payload: Payload::None,
        }
    }

    pub fn mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    pub fn callback(mut self, cb: impl FnOnce(TaskReport, Payload) + Send + 'static) -> Self {
        self.callback = Some(Box::new(cb));
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_is_clamped() {
        assert_eq!(Progress::percent(150), Progress::Percent(100));
        assert_eq!(Progress::percent(42), Progress::Percent(42));
    }

    #[test]
    fn live_stats_roundtrip() {
        let stats = LiveStats::new();
        assert_eq!(stats.progress(), Progress::Indeterminate);

        stats.set_progress(Progress::percent(30));
        assert_eq!(stats.progress(), Progress::Percent(30));

        stats.set_bytes(100);
        stats.add_bytes(28);
        assert_eq!(stats.bytes(), 128);
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Errored.is_terminal());
    }

    #[test]
    fn payload_downcast() {
        let owned = Payload::owned(vec![1u8, 2, 3]);
        assert_eq!(owned.downcast_ref::<Vec<u8>>(), Some(&vec![1u8, 2, 3]));
        assert!(owned.downcast_ref::<String>().is_none());

        let shared = Arc::new("hello".to_string());
        let borrowed = Payload::borrowed(Arc::clone(&shared));
        assert_eq!(borrowed.downcast_ref::<String>().map(String::as_str), Some("hello"));

        // Dropping the borrowed payload must not release the caller's value.
        drop(borrowed);
        assert_eq!(shared.as_str(), "hello");
    }
}
