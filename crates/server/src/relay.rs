//! Relay queue and delivery loop.
//!
//! A worker pushes `MessageEvent`s into its session's [`RelayProducer`]; one
//! delivery loop per session drains the matching [`RelayConsumer`] and
//! forwards each event to the client that started the session.
//!
//! The queue is unbounded so a bursty worker never waits on the network.
//! Exactly one `Terminate` marker is ever enqueued; whatever arrives after it
//! is never forwarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voicedock_connector_core::{MessageEvent, MessageSink};
use voicedock_protocol::{ErrorKind, ServerMessage};

use crate::transport::{ClientAddress, Transport};

#[derive(Debug)]
pub enum RelayItem {
    /// Acknowledgement of the start request; always the first item.
    Started(String),
    Message(MessageEvent),
    /// The worker died; tell the client before the marker.
    Failure(String),
    Terminate,
}

/// Producer side of a session's relay queue (cheap to Clone).
#[derive(Clone)]
pub struct RelayProducer {
    tx: mpsc::UnboundedSender<RelayItem>,
    terminated: Arc<AtomicBool>,
}

pub struct RelayConsumer {
    rx: mpsc::UnboundedReceiver<RelayItem>,
}

pub fn relay_queue() -> (RelayProducer, RelayConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RelayProducer {
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        },
        RelayConsumer { rx },
    )
}

impl RelayProducer {
    /// Enqueue an event. Returns false once the queue has been terminated.
    pub fn send(&self, event: MessageEvent) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            debug!(
                component = "relay",
                event = "relay.send.after_terminate",
                "Dropping event enqueued after termination"
            );
            return false;
        }
        self.tx.send(RelayItem::Message(event)).is_ok()
    }

    /// Enqueue the `agent_started` acknowledgement. Call before the worker runs.
    pub fn acknowledge(&self, message: &str) {
        if !self.terminated.load(Ordering::Acquire) {
            let _ = self.tx.send(RelayItem::Started(message.to_string()));
        }
    }

    pub fn report_failure(&self, detail: String) {
        if !self.terminated.load(Ordering::Acquire) {
            let _ = self.tx.send(RelayItem::Failure(detail));
        }
    }

    /// Enqueue the termination marker. Only the first call has any effect.
    pub fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(RelayItem::Terminate);
        true
    }

    #[allow(dead_code)]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

impl MessageSink for RelayProducer {
    fn emit(&self, event: MessageEvent) {
        self.send(event);
    }
}

impl RelayConsumer {
    /// Wait for the next item. A closed queue reads as `Terminate`.
    pub async fn next(&mut self) -> RelayItem {
        self.rx.recv().await.unwrap_or(RelayItem::Terminate)
    }
}

/// Who a delivery loop is forwarding for
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub client: ClientAddress,
    pub channel_name: String,
    pub session_id: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Drain `consumer` in order until the termination marker.
///
/// A failed delivery is logged and skipped; it never ends the loop.
pub async fn run_delivery_loop(
    mut consumer: RelayConsumer,
    transport: Arc<dyn Transport>,
    target: DeliveryTarget,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();

    loop {
        let msg = match consumer.next().await {
            RelayItem::Started(message) => ServerMessage::AgentStarted {
                channel_name: target.channel_name.clone(),
                message,
            },
            RelayItem::Message(event) => ServerMessage::AgentMessage {
                channel_name: target.channel_name.clone(),
                payload: event.delta,
            },
            RelayItem::Failure(detail) => ServerMessage::Error {
                kind: ErrorKind::WorkerFailure,
                detail: Value::String(detail),
                channel_name: Some(target.channel_name.clone()),
            },
            RelayItem::Terminate => break,
        };

        match transport.deliver(target.client, msg).await {
            Ok(()) => stats.delivered += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(
                    component = "relay",
                    event = "relay.deliver.failed",
                    channel_name = %target.channel_name,
                    session_id = %target.session_id,
                    client = %target.client,
                    error = %e,
                    "Failed to deliver agent message"
                );
            }
        }

        // Let other sessions' loops run between messages.
        tokio::task::yield_now().await;
    }

    info!(
        component = "relay",
        event = "relay.loop.exited",
        channel_name = %target.channel_name,
        session_id = %target.session_id,
        delivered = stats.delivered,
        failed = stats.failed,
        "Delivery loop exited"
    );
    stats
}
