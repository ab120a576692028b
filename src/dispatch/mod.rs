//! Callback dispatcher.
//!
//! Guarantees each task's completion callback runs exactly once, on the
//! thread that owns the main loop, strictly after the task reached a terminal
//! state and never concurrently with mutation of its queue entry (the entry
//! is removed before the callback runs).

use std::thread::{self, ThreadId};

use tracing::debug;

use crate::queue::TaskQueue;
use crate::task::Payload;

pub(crate) struct Dispatcher {
    main_thread: ThreadId,
}

impl Dispatcher {
    /// Capture the current thread as the main-loop thread.
    pub fn new() -> Self {
        Self {
            main_thread: thread::current().id(),
        }
    }

    /// Drain all finalized tasks, in the order they became terminal, and run
    /// their callbacks. Returns the number of callbacks dispatched.
    ///
    /// Owned payloads move into the callback and are released when it
    /// returns; if a task has no callback the payload is released here. Both
    /// paths run cleanup exactly once, whatever the terminal state was.
    pub fn dispatch(&self, queue: &TaskQueue) -> usize {
        debug_assert_eq!(
            thread::current().id(),
            self.main_thread,
            "callbacks must be dispatched from the main-loop thread"
        );

        let mut dispatched = 0;
        for finalized in queue.drain_finished() {
            let id = finalized.report.id;
            let state = finalized.report.state;
            match finalized.callback {
                Some(callback) => {
                    callback(finalized.report, finalized.payload);
                    dispatched += 1;
                }
                None => {
                    // Still counts as finalization: the owned payload (if
                    // any) is dropped right here.
                    drop::<Payload>(finalized.payload);
                }
            }
            debug!("Dispatched completion of task {} ({})", id, state);
        }
        dispatched
    }
}
