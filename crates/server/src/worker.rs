//! Worker supervision
//!
//! Each worker runs in its own task. A supervisor task awaits it and then,
//! however the worker ended (returned, failed, panicked, or was aborted),
//! drops a [`SessionFinalizer`] that removes the registry entry and enqueues
//! the relay's termination marker.

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use voicedock_connector_core::AgentWorker;

use crate::registry::SessionRegistry;
use crate::relay::RelayProducer;

/// The orchestrator's grip on a running worker
#[derive(Debug, Default)]
pub struct WorkerHandle {
    stop: CancellationToken,
    finished: CancellationToken,
    abort: Option<AbortHandle>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop. Best effort; see [`AgentWorker::run`].
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancelled once the worker's cleanup has run
    pub fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub(crate) fn attach(&mut self, abort: AbortHandle) {
        self.abort = Some(abort);
    }

    pub(crate) fn force_abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }
}

/// How a worker's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Completed,
    Failed(String),
    Panicked(String),
    Aborted,
}

/// Cleanup for one session, run exactly once on drop.
pub(crate) struct SessionFinalizer {
    pub registry: SessionRegistry,
    pub relay: RelayProducer,
    pub channel_name: String,
    pub session_id: String,
    pub finished: CancellationToken,
}

impl Drop for SessionFinalizer {
    fn drop(&mut self) {
        self.registry
            .mark_stopping(&self.channel_name, &self.session_id);
        let removed = self
            .registry
            .remove(&self.channel_name, &self.session_id)
            .is_some();
        self.relay.terminate();
        self.finished.cancel();

        info!(
            component = "session",
            event = "session.terminated",
            channel_name = %self.channel_name,
            session_id = %self.session_id,
            removed,
            "Agent stopped for channel"
        );
    }
}

/// Start `worker` on its own task under a supervisor.
///
/// Returns the worker task's abort handle for forced reclamation.
pub(crate) fn spawn_supervised(
    worker: Box<dyn AgentWorker>,
    stop: CancellationToken,
    finalizer: SessionFinalizer,
) -> AbortHandle {
    let run = tokio::spawn(worker.run(stop));
    let abort = run.abort_handle();

    tokio::spawn(async move {
        let exit = match run.await {
            Ok(Ok(())) => WorkerExit::Completed,
            Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
            Err(e) if e.is_cancelled() => WorkerExit::Aborted,
            Err(e) => WorkerExit::Panicked(e.to_string()),
        };

        match &exit {
            WorkerExit::Completed | WorkerExit::Aborted => {
                info!(
                    component = "session",
                    event = "session.worker.exited",
                    channel_name = %finalizer.channel_name,
                    session_id = %finalizer.session_id,
                    exit = ?exit,
                    "Worker exited"
                );
            }
            WorkerExit::Failed(detail) | WorkerExit::Panicked(detail) => {
                warn!(
                    component = "session",
                    event = "session.worker.failed",
                    channel_name = %finalizer.channel_name,
                    session_id = %finalizer.session_id,
                    error = %detail,
                    "Worker failed"
                );
                finalizer.relay.report_failure(detail.clone());
            }
        }

        drop(finalizer);
    });

    abort
}
