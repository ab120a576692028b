//! Task engine orchestration.
//!
//! [`TaskEngine`] is an explicit context object with defined construction and
//! teardown: it owns the queue, the pump's worker threads (threaded mode),
//! the callback dispatcher and the shared collaborators that task handlers
//! need (HTTP client, discovery backend, autoconfig profile registry). There
//! is no module-level static state; independent engines can coexist.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, PushError};
use crate::kinds::autoconfig::ProfileRegistry;
use crate::kinds::discovery::{DiscoveryBackend, LobbyDiscoveryBackend};
use crate::pump::{self, PumpMode};
use crate::queue::{TaskQueue, TaskView};
use crate::retrieve::{Retriever, TransferStatus};
use crate::task::{TaskId, TaskKind, TaskOutcome, TaskSpec, TaskState};

pub struct TaskEngine {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) config: EngineConfig,
    pub(crate) http: reqwest::blocking::Client,
    pub(crate) discovery: Arc<dyn DiscoveryBackend>,
    pub(crate) profiles: Arc<ProfileRegistry>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TaskEngine {
    /// Build an engine. Must be called on the thread that owns the main
    /// loop: completion callbacks will run on this thread.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        let discovery: Arc<dyn DiscoveryBackend> = Arc::new(LobbyDiscoveryBackend::new(
            http.clone(),
            config.lobby_url.clone(),
        ));

        let profiles = Arc::new(match &config.autoconfig_dir {
            Some(dir) => ProfileRegistry::load_dir(dir),
            None => ProfileRegistry::default(),
        });

        let queue = Arc::new(TaskQueue::new());
        let shutdown = CancellationToken::new();

        let mut workers = Vec::new();
        if let PumpMode::Threaded { workers: count } = config.mode {
            for idx in 0..count {
                let queue = Arc::clone(&queue);
                let shutdown = shutdown.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("task-worker-{idx}"))
                    .spawn(move || pump::worker_loop(queue, shutdown, idx))
                    .map_err(EngineError::WorkerSpawn)?;
                workers.push(handle);
            }
            info!("Task engine started in threaded mode with {} workers", count);
        } else {
            info!("Task engine started in cooperative mode");
        }

        Ok(Self {
            queue,
            config,
            http,
            discovery,
            profiles,
            dispatcher: Dispatcher::new(),
            shutdown,
            workers,
        })
    }

    /// Replace the discovery backend (used by tests and embedders with their
    /// own network stack).
    pub fn set_discovery_backend(&mut self, backend: Arc<dyn DiscoveryBackend>) {
        self.discovery = backend;
    }

    /// Advance the engine by one main-loop frame.
    ///
    /// Cooperative mode: steps every runnable task within its quantum, then
    /// dispatches completion callbacks. Threaded mode: only reconciles
    /// newly-terminal tasks and dispatches their callbacks; workers advance
    /// the handlers. Returns the number of callbacks dispatched.
    pub fn tick(&self) -> usize {
        if self.config.mode == PumpMode::Cooperative {
            pump::cooperative_tick(&self.queue, self.config.steps_per_tick);
        }
        self.dispatcher.dispatch(&self.queue)
    }

    /// Request cooperative cancellation of one task. Idempotent; returns
    /// false when the task has already been finalized and removed.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.queue.request_cancel(id)
    }

    /// Read-only view over the live queue.
    pub fn retriever(&self) -> Retriever<'_> {
        Retriever::new(&self.queue)
    }

    /// Snapshot of live tasks, optionally filtered by kind.
    pub fn query(&self, kind: Option<TaskKind>) -> Vec<TaskView> {
        self.retriever().query(kind)
    }

    /// In-flight network transfers with their accumulated byte counts.
    pub fn transfer_list(&self) -> Vec<TransferStatus> {
        self.retriever().transfer_list()
    }

    /// Bulk-cancel every non-terminal task of one kind.
    pub fn cancel_all_of_kind(&self, kind: TaskKind) -> usize {
        self.retriever().cancel_all_of_kind(kind)
    }

    /// Number of tasks that have not yet been finalized and dispatched.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Tear the engine down: cancels every live task, joins workers and
    /// dispatches the remaining completion callbacks (each still fires
    /// exactly once, as `Cancelled`). Must run on the main-loop thread.
    pub fn shutdown(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Task engine shutting down");
        self.shutdown.cancel();
        self.queue.cancel_all();
        self.queue.notify_all();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        // Everything left is either already terminal or cancelled-but-queued;
        // claiming flushes the latter without running any handler body.
        while let Some(claimed) = self.queue.claim_next() {
            debug!("Cancelling task {} claimed during shutdown", claimed.id);
            claimed.cancel.cancel();
            self.queue
                .mark_terminal(claimed.id, TaskState::Cancelled, TaskOutcome::None, None);
        }
        if self.config.mode == PumpMode::Cooperative {
            pump::cooperative_tick(&self.queue, 1);
        }
        self.dispatcher.dispatch(&self.queue);
        info!("Task engine shutdown complete");
    }

    /// Whether handlers must offload blocking I/O to helper threads. True in
    /// cooperative mode, where a handler step shares the main-loop frame.
    pub(crate) fn offload_io(&self) -> bool {
        self.config.mode == PumpMode::Cooperative
    }

    /// Enqueue a validated task spec.
    pub(crate) fn submit(&self, spec: TaskSpec) -> Result<TaskId, PushError> {
        if self.shutdown.is_cancelled() {
            return Err(PushError::ShutDown);
        }
        Ok(self.queue.enqueue(spec))
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
