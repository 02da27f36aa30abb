//! Session orchestrator
//!
//! Owns the [`SessionRegistry`] and drives each channel session through
//! `Starting → Active → Stopping → Terminated`:
//!
//! - `start_session` validates, reserves the channel, builds the worker and
//!   its relay queue, and starts both without awaiting anything. The
//!   `agent_started` ack is the first item on the relay queue, so it always
//!   reaches the client ahead of the agent's output.
//! - `stop_session` flips the session to `Stopping`, signals the worker, and
//!   leaves a reaper behind that force-reclaims it after `stop_timeout`.
//! - Worker exit of any kind runs the same cleanup (see `worker.rs`).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use voicedock_connector_core::{InferenceConfig, MessageSink, WorkerFactory, WorkerSpec};
use voicedock_protocol::SessionSummary;

use crate::error::SessionError;
use crate::registry::{ChannelSession, SessionRegistry, StopTicket};
use crate::relay::{relay_queue, run_delivery_loop, DeliveryTarget};
use crate::transport::{ClientAddress, Transport};
use crate::validation::validate_start_request;
use crate::worker::{spawn_supervised, SessionFinalizer};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra time shutdown gives delivery loops to flush their backlog
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub app_id: String,
    pub app_cert: Option<String>,
    /// How long a stopped worker may take before it is force-reclaimed
    pub stop_timeout: Duration,
}

struct Inner {
    registry: SessionRegistry,
    factory: Arc<dyn WorkerFactory>,
    transport: Arc<dyn Transport>,
    /// One delivery loop per session
    deliveries: TaskTracker,
    config: OrchestratorConfig,
}

/// Cheap to Clone; all clones share one registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        factory: Arc<dyn WorkerFactory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                factory,
                transport,
                deliveries: TaskTracker::new(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.inner.registry.summaries()
    }

    /// Delivery loops that have not exited yet
    pub fn delivery_loops(&self) -> usize {
        self.inner.deliveries.len()
    }

    /// Start an agent for the channel named in `payload` on behalf of `client`.
    ///
    /// Returns the new session id. The `agent_started` acknowledgement is
    /// delivered to `client` by the session's delivery loop, not returned.
    pub fn start_session(
        &self,
        client: ClientAddress,
        payload: &Value,
    ) -> Result<String, SessionError> {
        let request = validate_start_request(payload)?;
        let channel_name = request.channel_name.clone();
        let session_id = voicedock_protocol::new_id();
        let registry = &self.inner.registry;

        if !registry.register(ChannelSession::reserve(&channel_name, &session_id, client)) {
            info!(
                component = "session",
                event = "session.start.busy",
                client = %client,
                channel_name = %channel_name,
                "Channel is already in use"
            );
            return Err(SessionError::ChannelBusy(channel_name));
        }

        // The reservation owns the stop/finished tokens from here on.
        let Some((stop, finished)) = registry.tokens(&channel_name, &session_id) else {
            return Err(SessionError::ChannelBusy(channel_name));
        };

        let spec = WorkerSpec {
            app_id: self.inner.config.app_id.clone(),
            app_cert: self.inner.config.app_cert.clone(),
            channel_name: channel_name.clone(),
            uid: request.uid,
            inference: InferenceConfig::new(request.system_instruction.as_deref(), request.voice),
        };
        debug!(
            component = "session",
            event = "session.start.configured",
            channel_name = %channel_name,
            uid = request.uid,
            voice = %request.voice,
            language = %request.language,
            "Built inference configuration"
        );

        let (producer, consumer) = relay_queue();
        let sink: Arc<dyn MessageSink> = Arc::new(producer.clone());
        let worker = match self.inner.factory.new_worker(spec, sink) {
            Ok(worker) => worker,
            Err(e) => {
                registry.remove(&channel_name, &session_id);
                warn!(
                    component = "session",
                    event = "session.start.worker_failed",
                    channel_name = %channel_name,
                    error = %e,
                    "Failed to build worker"
                );
                return Err(SessionError::WorkerFailure {
                    channel_name,
                    source: e,
                });
            }
        };

        producer.acknowledge("Agent is starting");
        self.inner.deliveries.spawn(run_delivery_loop(
            consumer,
            self.inner.transport.clone(),
            DeliveryTarget {
                client,
                channel_name: channel_name.clone(),
                session_id: session_id.clone(),
            },
        ));

        let abort = spawn_supervised(
            worker,
            stop,
            SessionFinalizer {
                registry: registry.clone(),
                relay: producer.clone(),
                channel_name: channel_name.clone(),
                session_id: session_id.clone(),
                finished,
            },
        );

        if !registry.activate(&channel_name, &session_id, abort.clone(), producer.clone()) {
            // Reclaimed before we could attach; make sure nothing lingers.
            abort.abort();
            producer.terminate();
        }

        info!(
            component = "session",
            event = "session.started",
            client = %client,
            channel_name = %channel_name,
            session_id = %session_id,
            "Agent is starting"
        );
        Ok(session_id)
    }

    /// Ask the agent on `channel_name` to stop.
    ///
    /// Returns as soon as the worker has been signalled; the channel stays
    /// reserved until the worker is gone or reclaimed.
    pub fn stop_session(&self, channel_name: &str) -> Result<(), SessionError> {
        let ticket = self
            .inner
            .registry
            .begin_stop(channel_name)
            .ok_or_else(|| SessionError::NoActiveSession(channel_name.to_string()))?;

        info!(
            component = "session",
            event = "session.stop.requested",
            channel_name = %channel_name,
            session_id = %ticket.session_id,
            "Stopping agent for channel"
        );

        let this = self.clone();
        tokio::spawn(async move { this.reap(ticket).await });
        Ok(())
    }

    /// Stop every session started by `client`. Returns how many were signalled.
    pub fn stop_client_sessions(&self, client: ClientAddress) -> usize {
        self.inner
            .registry
            .channels_for_client(client)
            .into_iter()
            .filter(|channel| self.stop_session(channel).is_ok())
            .count()
    }

    /// Stop everything and wait (bounded) for the registry and the delivery
    /// loops to drain.
    pub async fn shutdown(&self) {
        let channels = self.inner.registry.channel_names();
        info!(
            component = "session",
            event = "session.shutdown",
            sessions = channels.len(),
            "Stopping all sessions"
        );

        let mut waits = Vec::new();
        for channel in channels {
            if let Some(ticket) = self.inner.registry.begin_stop(&channel) {
                waits.push(ticket.finished.clone());
                let this = self.clone();
                tokio::spawn(async move { this.reap(ticket).await });
            } else if let Some(finished) = self.inner.registry.finished_token(&channel) {
                // Already stopping; its reaper is on it.
                waits.push(finished);
            }
        }

        let all = futures::future::join_all(waits.iter().map(|t| t.cancelled()));
        let bound = self.inner.config.stop_timeout + Duration::from_secs(1);
        if tokio::time::timeout(bound, all).await.is_err() {
            warn!(
                component = "session",
                event = "session.shutdown.timeout",
                remaining = self.inner.registry.len(),
                "Timed out waiting for sessions to stop"
            );
        }

        self.inner.deliveries.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.inner.deliveries.wait())
            .await
            .is_err()
        {
            warn!(
                component = "session",
                event = "session.shutdown.drain_timeout",
                remaining = self.inner.deliveries.len(),
                "Timed out waiting for delivery loops to flush"
            );
        }
    }

    /// Wait for a stopping worker; reclaim it if it overstays.
    async fn reap(&self, ticket: StopTicket) {
        let timeout = self.inner.config.stop_timeout;
        if tokio::time::timeout(timeout, ticket.finished.cancelled())
            .await
            .is_ok()
        {
            return;
        }

        let reclaimed = self
            .inner
            .registry
            .reclaim(&ticket.channel_name, &ticket.session_id);
        warn!(
            component = "session",
            event = "session.stop.reclaimed",
            channel_name = %ticket.channel_name,
            session_id = %ticket.session_id,
            timeout_ms = timeout.as_millis() as u64,
            reclaimed,
            "Worker did not stop in time, reclaimed"
        );
    }
}
