//! Retriever: read-only, snapshot-consistent queries over the live queue.
//!
//! Used by progress UI aggregation and by bulk-cancel operations. Never
//! mutates task state beyond raising cancel flags, and never holds the queue
//! lock across a whole bulk operation.

use serde::Serialize;

use crate::queue::{TaskQueue, TaskView};
use crate::task::{Progress, TaskId, TaskKind, TaskState};

/// Progress of one in-flight network transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub id: TaskId,
    pub url: String,
    pub state: TaskState,
    pub progress: Progress,
    pub bytes_received: u64,
}

/// Non-owning, read-only view over the queue. Valid for the duration of the
/// snapshot traversals it performs; each call takes a fresh snapshot.
pub struct Retriever<'a> {
    queue: &'a TaskQueue,
}

impl<'a> Retriever<'a> {
    pub(crate) fn new(queue: &'a TaskQueue) -> Self {
        Self { queue }
    }

    /// All live tasks, optionally filtered by kind, in insertion order.
    pub fn query(&self, kind: Option<TaskKind>) -> Vec<TaskView> {
        match kind {
            Some(kind) => self.queue.find_by_kind(kind),
            None => self.queue.snapshot(|_| true),
        }
    }

    /// In-flight network transfers with their accumulated byte counts.
    pub fn transfer_list(&self) -> Vec<TransferStatus> {
        self.queue
            .find_by_kind(TaskKind::HttpTransfer)
            .into_iter()
            .map(|view| TransferStatus {
                id: view.id,
                url: view.title,
                state: view.state,
                progress: view.progress,
                bytes_received: view.bytes,
            })
            .collect()
    }

    /// Request cancellation of every non-terminal task of one kind.
    ///
    /// Queries first, then issues individual cancel requests, so the queue
    /// lock is never held across the whole bulk operation. Returns the number
    /// of cancel requests issued.
    pub fn cancel_all_of_kind(&self, kind: TaskKind) -> usize {
        let targets: Vec<TaskId> = self
            .queue
            .find_by_kind(kind)
            .into_iter()
            .filter(|v| !v.state.is_terminal())
            .map(|v| v.id)
            .collect();

        let mut requested = 0;
        for id in targets {
            if self.queue.request_cancel(id) {
                requested += 1;
            }
        }
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::{StepOutcome, TaskContext, TaskOutcome, TaskSpec};

    fn pending_handler(_ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        Ok(StepOutcome::Pending)
    }

    #[test]
    fn query_filters_by_kind() {
        let queue = TaskQueue::new();
        queue.enqueue(TaskSpec::new(TaskKind::HttpTransfer, "t1", pending_handler));
        queue.enqueue(TaskSpec::new(TaskKind::Screenshot, "s1", pending_handler));
        queue.enqueue(TaskSpec::new(TaskKind::HttpTransfer, "t2", pending_handler));

        let retriever = Retriever::new(&queue);
        assert_eq!(retriever.query(None).len(), 3);
        assert_eq!(retriever.query(Some(TaskKind::HttpTransfer)).len(), 2);
        assert_eq!(retriever.query(Some(TaskKind::DbScan)).len(), 0);
    }

    #[test]
    fn transfer_list_reports_titles_as_urls() {
        let queue = TaskQueue::new();
        queue.enqueue(TaskSpec::new(
            TaskKind::HttpTransfer,
            "http://example.com/a",
            pending_handler,
        ));

        let transfers = Retriever::new(&queue).transfer_list();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].url, "http://example.com/a");
        assert_eq!(transfers[0].bytes_received, 0);
    }

    #[test]
    fn cancel_all_of_kind_spares_other_kinds_and_terminal_tasks() {
        let queue = TaskQueue::new();
        let t1 = queue.enqueue(TaskSpec::new(TaskKind::HttpTransfer, "t1", pending_handler));
        let t2 = queue.enqueue(TaskSpec::new(TaskKind::HttpTransfer, "t2", pending_handler));
        let other = queue.enqueue(TaskSpec::new(TaskKind::DbScan, "scan", pending_handler));

        // t2 already finished: bulk cancel must skip it.
        queue.mark_terminal(t2, TaskState::Finished, TaskOutcome::None, None);

        let requested = Retriever::new(&queue).cancel_all_of_kind(TaskKind::HttpTransfer);
        assert_eq!(requested, 1);

        // Cancelled-before-pickup path applies to t1 only.
        crate::pump::cooperative_tick(&queue, 1);
        let views = queue.snapshot(|_| true);
        let state_of = |id| views.iter().find(|v| v.id == id).map(|v| v.state);
        assert_eq!(state_of(t1), Some(TaskState::Cancelled));
        assert_eq!(state_of(other), Some(TaskState::Running));
    }
}
