//! Thread-safe task queue.
//!
//! Owns every live task from enqueue until its callback has run. The internal
//! mutex is the only synchronization point in the engine: snapshots, state
//! transitions and finalization bookkeeping all happen under it, so no reader
//! ever observes a task mid-mutation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::task::{
    LiveStats, Payload, Progress, TaskCallback, TaskContext, TaskHandler, TaskId, TaskKind,
    TaskOutcome, TaskReport, TaskSpec, TaskState,
};

/// Read-only copy of one task's metadata, taken under a single lock
/// acquisition. Valid only for the snapshot that produced it.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub progress: Progress,
    pub title: String,
    /// Bytes processed so far, for kinds that report it (e.g. transfers).
    pub bytes: u64,
}

/// One live task owned by the queue.
struct TaskEntry {
    id: TaskId,
    kind: TaskKind,
    title: String,
    mute: bool,
    state: TaskState,
    stats: Arc<LiveStats>,
    cancel: CancellationToken,
    /// Present while nothing is advancing the task. Taken by exactly one
    /// execution context at a time; returned only when the step was pending.
    handler: Option<Box<dyn TaskHandler>>,
    callback: Option<TaskCallback>,
    payload: Payload,
    error: Option<String>,
    outcome: TaskOutcome,
}

struct QueueInner {
    entries: Vec<TaskEntry>,
    /// Terminal tasks in the order they finished, awaiting dispatch.
    finished: VecDeque<TaskId>,
}

/// A task claimed for advancement: the handler is physically moved out of the
/// queue, so no second context can step it concurrently.
pub(crate) struct ClaimedTask {
    pub id: TaskId,
    pub handler: Box<dyn TaskHandler>,
    pub ctx: TaskContext,
    pub cancel: CancellationToken,
}

/// A finalized task ready for callback dispatch, already removed from the
/// queue. Dropping it without invoking the callback still releases an owned
/// payload exactly once.
pub(crate) struct FinalizedTask {
    pub report: TaskReport,
    pub callback: Option<TaskCallback>,
    pub payload: Payload,
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    work_available: Condvar,
    next_id: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: Vec::new(),
                finished: VecDeque::new(),
            }),
            work_available: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A poisoning panic in a handler must not wedge the whole engine.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a validated task. Always succeeds; validation happened at push
    /// time.
    pub fn enqueue(&self, spec: TaskSpec) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = TaskEntry {
            id,
            kind: spec.kind,
            title: spec.title,
            mute: spec.mute,
            state: TaskState::Queued,
            stats: Arc::new(LiveStats::new()),
            cancel: CancellationToken::new(),
            handler: Some(spec.handler),
            callback: spec.callback,
            payload: spec.payload,
            error: None,
            outcome: TaskOutcome::None,
        };
        debug!("Enqueued {} task {} ({})", entry.kind, id, entry.title);
        self.lock().entries.push(entry);
        self.work_available.notify_one();
        id
    }

    /// Copy the metadata of every task matching `predicate`, in insertion
    /// order, under a single critical section.
    pub fn snapshot(&self, predicate: impl Fn(&TaskView) -> bool) -> Vec<TaskView> {
        self.lock()
            .entries
            .iter()
            .map(view_of)
            .filter(|v| predicate(v))
            .collect()
    }

    /// All tasks of one kind, in insertion order.
    pub fn find_by_kind(&self, kind: TaskKind) -> Vec<TaskView> {
        self.snapshot(|v| v.kind == kind)
    }

    /// Request cooperative cancellation. Idempotent; returns false when the
    /// task is unknown (already finalized and removed).
    pub fn request_cancel(&self, id: TaskId) -> bool {
        let inner = self.lock();
        match inner.entries.iter().find(|e| e.id == id) {
            Some(entry) => {
                if !entry.state.is_terminal() {
                    entry.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Remove a task that has already been finalized and dispatched.
    ///
    /// Removing a non-terminal task is a programming error: reported, never
    /// silently ignored.
    pub fn remove(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let idx = inner
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(QueueError::NotFound(id))?;
        if !inner.entries[idx].state.is_terminal() {
            debug_assert!(false, "removing non-terminal task {id}");
            error!("Attempted to remove non-terminal task {}", id);
            return Err(QueueError::NotTerminal(id));
        }
        inner.entries.remove(idx);
        inner.finished.retain(|f| *f != id);
        Ok(())
    }

    /// Number of tasks that have not yet been finalized and removed.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of tasks still awaiting pick-up or mid-run.
    pub fn live_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    // =========================================================================
    // Pump-facing operations
    // =========================================================================

    /// Claim the next `Queued` task for a worker, transitioning it to
    /// `Running` and taking its handler out of the queue.
    ///
    /// Tasks whose cancel flag was raised before pick-up finalize as
    /// `Cancelled` right here, without their handler ever running.
    pub(crate) fn claim_next(&self) -> Option<ClaimedTask> {
        let mut inner = self.lock();
        loop {
            let idx = inner
                .entries
                .iter()
                .position(|e| e.state == TaskState::Queued)?;
            if inner.entries[idx].cancel.is_cancelled() {
                Self::finalize_locked(&mut inner, idx, TaskState::Cancelled, TaskOutcome::None, None);
                continue;
            }
            let entry = &mut inner.entries[idx];
            entry.state = TaskState::Running;
            let handler = entry
                .handler
                .take()
                .expect("queued task must hold its handler");
            let ctx = TaskContext::new(entry.cancel.clone(), Arc::clone(&entry.stats));
            return Some(ClaimedTask {
                id: entry.id,
                handler,
                ctx,
                cancel: entry.cancel.clone(),
            });
        }
    }

    /// Claim every task a cooperative tick should advance: all `Queued` tasks
    /// plus every `Running` task whose handler is parked between steps.
    pub(crate) fn claim_runnable(&self) -> Vec<ClaimedTask> {
        let mut inner = self.lock();
        let mut claimed = Vec::new();
        let mut idx = 0;
        while idx < inner.entries.len() {
            let (state, cancelled) = {
                let e = &inner.entries[idx];
                (e.state, e.cancel.is_cancelled())
            };
            match state {
                TaskState::Queued if cancelled => {
                    Self::finalize_locked(&mut inner, idx, TaskState::Cancelled, TaskOutcome::None, None);
                    idx += 1;
                    continue;
                }
                TaskState::Queued | TaskState::Running => {
                    let entry = &mut inner.entries[idx];
                    if let Some(handler) = entry.handler.take() {
                        entry.state = TaskState::Running;
                        let ctx = TaskContext::new(entry.cancel.clone(), Arc::clone(&entry.stats));
                        claimed.push(ClaimedTask {
                            id: entry.id,
                            handler,
                            ctx,
                            cancel: entry.cancel.clone(),
                        });
                    }
                }
                _ => {}
            }
            idx += 1;
        }
        claimed
    }

    /// Park a handler back into its entry after a pending step.
    pub(crate) fn return_handler(&self, id: TaskId, handler: Box<dyn TaskHandler>) {
        let mut inner = self.lock();
        match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) if !entry.state.is_terminal() => entry.handler = Some(handler),
            Some(_) => warn!("Dropping handler returned for already-terminal task {}", id),
            None => warn!("Dropping handler returned for unknown task {}", id),
        }
    }

    /// Transition a task into a terminal state and queue it for dispatch.
    ///
    /// Double finalization is a contract violation: asserted in debug builds,
    /// logged and ignored in release builds.
    pub(crate) fn mark_terminal(
        &self,
        id: TaskId,
        state: TaskState,
        outcome: TaskOutcome,
        error: Option<String>,
    ) {
        debug_assert!(state.is_terminal());
        let mut inner = self.lock();
        let Some(idx) = inner.entries.iter().position(|e| e.id == id) else {
            debug_assert!(false, "finalizing unknown task {id}");
            error!("Attempted to finalize unknown task {}", id);
            return;
        };
        if inner.entries[idx].state.is_terminal() {
            debug_assert!(false, "double finalization of task {id}");
            error!("Attempted double finalization of task {}", id);
            return;
        }
        Self::finalize_locked(&mut inner, idx, state, outcome, error);
    }

    fn finalize_locked(
        inner: &mut QueueInner,
        idx: usize,
        state: TaskState,
        outcome: TaskOutcome,
        error: Option<String>,
    ) {
        let entry = &mut inner.entries[idx];
        entry.state = state;
        entry.outcome = outcome;
        entry.error = error;
        // A cancelled-before-pickup task still holds its handler; it will
        // never run, so release it now.
        entry.handler = None;
        let id = entry.id;
        debug!("Task {} finalized as {}", id, state);
        inner.finished.push_back(id);
    }

    /// Remove every finalized task, in the order they became terminal, and
    /// hand back what the dispatcher needs to run their callbacks.
    pub(crate) fn drain_finished(&self) -> Vec<FinalizedTask> {
        let mut inner = self.lock();
        let mut drained = Vec::new();
        while let Some(id) = inner.finished.pop_front() {
            let Some(idx) = inner.entries.iter().position(|e| e.id == id) else {
                // Removed explicitly via `remove` after finalization.
                continue;
            };
            let mut entry = inner.entries.remove(idx);
            drained.push(FinalizedTask {
                report: TaskReport {
                    id: entry.id,
                    kind: entry.kind,
                    state: entry.state,
                    title: std::mem::take(&mut entry.title),
                    mute: entry.mute,
                    error: entry.error.take(),
                    outcome: std::mem::replace(&mut entry.outcome, TaskOutcome::None),
                },
                callback: entry.callback.take(),
                payload: std::mem::replace(&mut entry.payload, Payload::None),
            });
        }
        drained
    }

    /// Block a worker until new work may be available or the timeout elapses.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let inner = self.lock();
        if inner.entries.iter().any(|e| e.state == TaskState::Queued) {
            return;
        }
        let _ = self
            .work_available
            .wait_timeout(inner, timeout)
            .map(|(guard, _)| drop(guard));
    }

    /// Wake all parked workers (used at shutdown).
    pub(crate) fn notify_all(&self) {
        self.work_available.notify_all();
    }

    /// Raise the cancel flag on every non-terminal task.
    pub(crate) fn cancel_all(&self) {
        let inner = self.lock();
        for entry in &inner.entries {
            if !entry.state.is_terminal() {
                entry.cancel.cancel();
            }
        }
    }
}

fn view_of(entry: &TaskEntry) -> TaskView {
    TaskView {
        id: entry.id,
        kind: entry.kind,
        state: entry.state,
        progress: entry.stats.progress(),
        title: entry.title.clone(),
        bytes: entry.stats.bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepOutcome;

    fn noop_spec(kind: TaskKind, title: &str) -> TaskSpec {
        TaskSpec::new(kind, title, |_ctx: &TaskContext| {
            Ok(StepOutcome::Finished(TaskOutcome::None))
        })
    }

    #[test]
    fn enqueue_assigns_unique_ids_in_order() {
        let queue = TaskQueue::new();
        let a = queue.enqueue(noop_spec(TaskKind::HttpTransfer, "a"));
        let b = queue.enqueue(noop_spec(TaskKind::Decompress, "b"));
        assert!(a < b);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn snapshot_filters_by_predicate_in_insertion_order() {
        let queue = TaskQueue::new();
        queue.enqueue(noop_spec(TaskKind::HttpTransfer, "first"));
        queue.enqueue(noop_spec(TaskKind::DbScan, "second"));
        queue.enqueue(noop_spec(TaskKind::HttpTransfer, "third"));

        let transfers = queue.find_by_kind(TaskKind::HttpTransfer);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].title, "first");
        assert_eq!(transfers[1].title, "third");
        assert!(transfers.iter().all(|v| v.state == TaskState::Queued));
    }

    #[test]
    fn remove_rejects_non_terminal_tasks() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(noop_spec(TaskKind::ImageLoad, "img"));
        // debug_assert fires in debug builds; validate the release-mode
        // contract through the error value.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| queue.remove(id)));
        match result {
            Ok(err) => assert_eq!(err, Err(QueueError::NotTerminal(id))),
            Err(_) => {} // debug_assert panicked, also acceptable
        }
        assert_eq!(queue.remove(TaskId(9999)), Err(QueueError::NotFound(TaskId(9999))));
    }

    #[test]
    fn cancel_is_idempotent() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(noop_spec(TaskKind::Discovery, "scan"));
        assert!(queue.request_cancel(id));
        assert!(queue.request_cancel(id));
        assert!(!queue.request_cancel(TaskId(777)));
    }

    #[test]
    fn cancelled_before_pickup_never_claims_handler() {
        let queue = TaskQueue::new();
        let id = queue.enqueue(noop_spec(TaskKind::Screenshot, "shot"));
        queue.request_cancel(id);

        assert!(queue.claim_next().is_none());

        let finished = queue.drain_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].report.state, TaskState::Cancelled);
        assert!(queue.is_empty());
    }

    #[test]
    fn claim_moves_handler_out_exactly_once() {
        let queue = TaskQueue::new();
        queue.enqueue(noop_spec(TaskKind::DbScan, "scan"));

        let claimed = queue.claim_next().expect("task should be claimable");
        // Second claim must not find the same task runnable.
        assert!(queue.claim_next().is_none());

        queue.return_handler(claimed.id, claimed.handler);
        let reclaimed = queue.claim_runnable();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed.id);
    }

    #[test]
    fn drain_preserves_terminal_order() {
        let queue = TaskQueue::new();
        let a = queue.enqueue(noop_spec(TaskKind::HttpTransfer, "a"));
        let b = queue.enqueue(noop_spec(TaskKind::HttpTransfer, "b"));

        // Finalize b first: dispatch order follows terminal order, not
        // insertion order.
        for id in [b, a] {
            let claimed = queue
                .claim_runnable()
                .into_iter()
                .find(|c| c.id == id);
            if let Some(c) = claimed {
                queue.return_handler(c.id, c.handler);
            }
            queue.mark_terminal(id, TaskState::Finished, TaskOutcome::None, None);
        }

        let drained = queue.drain_finished();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].report.id, b);
        assert_eq!(drained[1].report.id, a);
        assert!(queue.is_empty());
    }
}
