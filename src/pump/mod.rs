//! Pump: advances queued and running tasks.
//!
//! Two scheduling models, chosen once for the whole engine:
//!
//! - **Cooperative**: [`cooperative_tick`] is called once per frontend frame
//!   on the main-loop thread. Each live task gets a bounded number of handler
//!   steps per tick; a handler must never block inside a step.
//! - **Threaded**: worker threads run [`worker_loop`], claiming queued tasks
//!   and stepping their handlers to completion. Handlers may block on I/O.
//!   The main thread only reconciles terminal tasks and runs callbacks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::queue::{ClaimedTask, TaskQueue};
use crate::task::{StepOutcome, TaskId, TaskOutcome, TaskState};

/// Scheduling model for the engine, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Driven synchronously by the frontend's own loop; handlers never block.
    Cooperative,
    /// Handlers run to completion on dedicated worker threads.
    Threaded { workers: usize },
}

/// How long an idle worker parks before re-checking for work or shutdown.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Advance every runnable task by up to `steps_per_task` handler steps.
///
/// Cancelled-but-unstarted tasks are finalized inside the claim without their
/// handler body ever executing; a cancel observed between steps finalizes the
/// task at the start of its next quantum.
pub(crate) fn cooperative_tick(queue: &TaskQueue, steps_per_task: usize) {
    let steps_per_task = steps_per_task.max(1);
    for claimed in queue.claim_runnable() {
        advance(queue, claimed, steps_per_task);
    }
}

/// Body of one worker thread in threaded mode.
pub(crate) fn worker_loop(queue: Arc<TaskQueue>, shutdown: CancellationToken, worker_idx: usize) {
    debug!("Task worker {} started", worker_idx);
    while !shutdown.is_cancelled() {
        match queue.claim_next() {
            Some(claimed) => {
                let id = claimed.id;
                debug!("Worker {} picked up task {}", worker_idx, id);
                // Run to completion: keep stepping until the handler reports
                // a terminal outcome or observes its cancel flag.
                advance(&queue, claimed, usize::MAX);
                debug!("Worker {} released task {}", worker_idx, id);
            }
            None => queue.wait_for_work(WORKER_IDLE_WAIT),
        }
    }
    debug!("Task worker {} stopped", worker_idx);
}

/// Step one claimed task up to `budget` times, finalizing it on a terminal
/// outcome, handler error or observed cancellation, or parking the handler
/// back into the queue when the budget runs out mid-work.
fn advance(queue: &TaskQueue, claimed: ClaimedTask, budget: usize) {
    let ClaimedTask {
        id,
        mut handler,
        ctx,
        cancel,
    } = claimed;

    let mut steps = 0usize;
    loop {
        if cancel.is_cancelled() {
            finalize_cancelled(queue, id);
            return;
        }
        match handler.step(&ctx) {
            Ok(StepOutcome::Pending) => {
                steps += 1;
                if steps >= budget {
                    queue.return_handler(id, handler);
                    return;
                }
            }
            Ok(StepOutcome::Cancelled) => {
                finalize_cancelled(queue, id);
                return;
            }
            Ok(StepOutcome::Finished(outcome)) => {
                queue.mark_terminal(id, TaskState::Finished, outcome, None);
                return;
            }
            Err(err) => {
                finalize_errored(queue, id, err);
                return;
            }
        }
    }
}

fn finalize_cancelled(queue: &TaskQueue, id: TaskId) {
    info!("Task {} cancelled", id);
    queue.mark_terminal(id, TaskState::Cancelled, TaskOutcome::None, None);
}

fn finalize_errored(queue: &TaskQueue, id: TaskId, err: TaskError) {
    warn!("Task {} failed: {}", id, err);
    queue.mark_terminal(id, TaskState::Errored, TaskOutcome::None, Some(err.to_string()));
}
