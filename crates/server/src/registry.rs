//! Session registry
//!
//! Maps channel name → [`ChannelSession`]. This is the only structure shared
//! between sessions. Reservation goes through the map's entry API so the
//! "not present" check and the insert are one step; removal is always keyed
//! by `session_id` as well, so a late cleanup from an old session can never
//! evict a newer session on the same channel.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use voicedock_protocol::{SessionState, SessionSummary};

use crate::relay::RelayProducer;
use crate::transport::ClientAddress;
use crate::worker::WorkerHandle;

/// One agent run on one channel
pub struct ChannelSession {
    pub session_id: String,
    pub channel_name: String,
    pub client: ClientAddress,
    pub state: SessionState,
    pub started_at: String,
    worker: WorkerHandle,
    relay: Option<RelayProducer>,
}

impl ChannelSession {
    /// A placeholder in `Starting` state; no worker or queue exists yet.
    pub fn reserve(channel_name: &str, session_id: &str, client: ClientAddress) -> Self {
        Self {
            session_id: session_id.to_string(),
            channel_name: channel_name.to_string(),
            client,
            state: SessionState::Starting,
            started_at: crate::chrono_now(),
            worker: WorkerHandle::new(),
            relay: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            channel_name: self.channel_name.clone(),
            client_id: self.client.0,
            state: self.state,
            started_at: self.started_at.clone(),
        }
    }

    /// Give up on the worker: abort it and close the relay ourselves.
    fn force_reclaim(&self) {
        self.worker.force_abort();
        if let Some(relay) = &self.relay {
            relay.terminate();
        }
        self.worker.mark_finished();
    }
}

/// Handed to the stop path once a session has been flipped to `Stopping`
#[derive(Debug, Clone)]
pub struct StopTicket {
    pub channel_name: String,
    pub session_id: String,
    pub finished: CancellationToken,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, ChannelSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` if its channel is free. Returns false if taken.
    pub fn register(&self, session: ChannelSession) -> bool {
        match self.sessions.entry(session.channel_name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Attach the running worker and relay to a reservation.
    ///
    /// Returns false if the reservation is already gone (the worker finished
    /// or was reclaimed before we got here).
    pub fn activate(
        &self,
        channel_name: &str,
        session_id: &str,
        abort: AbortHandle,
        relay: RelayProducer,
    ) -> bool {
        let Some(mut session) = self.sessions.get_mut(channel_name) else {
            return false;
        };
        if session.session_id != session_id {
            return false;
        }
        session.worker.attach(abort);
        session.relay = Some(relay);
        if session.state == SessionState::Starting {
            session.state = SessionState::Active;
        }
        true
    }

    /// Move a live session to `Stopping` and signal its worker.
    ///
    /// Returns `None` if there is no session or it is already stopping.
    pub fn begin_stop(&self, channel_name: &str) -> Option<StopTicket> {
        let mut session = self.sessions.get_mut(channel_name)?;
        match session.state {
            SessionState::Starting | SessionState::Active => {
                session.state = SessionState::Stopping;
                session.worker.request_stop();
                Some(StopTicket {
                    channel_name: session.channel_name.clone(),
                    session_id: session.session_id.clone(),
                    finished: session.worker.finished_token(),
                })
            }
            SessionState::Stopping | SessionState::Terminated => None,
        }
    }

    /// Note that the worker's run returned on its own.
    pub fn mark_stopping(&self, channel_name: &str, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(channel_name) {
            if session.session_id == session_id {
                session.state = SessionState::Stopping;
            }
        }
    }

    pub fn remove(&self, channel_name: &str, session_id: &str) -> Option<ChannelSession> {
        self.sessions
            .remove_if(channel_name, |_, session| session.session_id == session_id)
            .map(|(_, mut session)| {
                session.state = SessionState::Terminated;
                session
            })
    }

    /// Remove a session whose worker would not stop, aborting it.
    pub fn reclaim(&self, channel_name: &str, session_id: &str) -> bool {
        match self.remove(channel_name, session_id) {
            Some(session) => {
                session.force_reclaim();
                true
            }
            None => false,
        }
    }

    /// The reservation's (stop, finished) tokens, for wiring up its worker.
    pub fn tokens(
        &self,
        channel_name: &str,
        session_id: &str,
    ) -> Option<(CancellationToken, CancellationToken)> {
        self.sessions
            .get(channel_name)
            .filter(|s| s.session_id == session_id)
            .map(|s| (s.worker.stop_token(), s.worker.finished_token()))
    }

    pub fn finished_token(&self, channel_name: &str) -> Option<CancellationToken> {
        self.sessions
            .get(channel_name)
            .map(|s| s.worker.finished_token())
    }

    pub fn lookup(&self, channel_name: &str) -> Option<SessionSummary> {
        self.sessions.get(channel_name).map(|s| s.summary())
    }

    #[allow(dead_code)]
    pub fn contains(&self, channel_name: &str) -> bool {
        self.sessions.contains_key(channel_name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn channels_for_client(&self, client: ClientAddress) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.client == client)
            .map(|s| s.key().clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self.sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay_queue;

    fn reserve(channel: &str, session_id: &str) -> ChannelSession {
        ChannelSession::reserve(channel, session_id, ClientAddress(1))
    }

    #[test]
    fn second_registration_for_a_channel_fails() {
        let registry = SessionRegistry::new();
        assert!(registry.register(reserve("room1", "a")));
        assert!(!registry.register(reserve("room1", "b")));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("room1").unwrap().session_id, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_has_exactly_one_winner() {
        let registry = SessionRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(reserve("room1", &format!("s{i}")))
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn activate_moves_starting_to_active() {
        let registry = SessionRegistry::new();
        registry.register(reserve("room1", "a"));
        let (producer, _consumer) = relay_queue();
        let task = tokio::spawn(std::future::pending::<()>());

        assert!(registry.activate("room1", "a", task.abort_handle(), producer));
        assert_eq!(registry.lookup("room1").unwrap().state, SessionState::Active);
        task.abort();
    }

    #[tokio::test]
    async fn activate_after_removal_reports_gone() {
        let registry = SessionRegistry::new();
        registry.register(reserve("room1", "a"));
        registry.remove("room1", "a");
        let (producer, _consumer) = relay_queue();
        let task = tokio::spawn(async {});

        assert!(!registry.activate("room1", "a", task.abort_handle(), producer));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_session_id_cannot_remove_newer_session() {
        let registry = SessionRegistry::new();
        registry.register(reserve("room1", "new"));

        assert!(registry.remove("room1", "old").is_none());
        assert!(registry.contains("room1"));

        let removed = registry.remove("room1", "new").unwrap();
        assert_eq!(removed.state, SessionState::Terminated);
        assert!(!registry.contains("room1"));
    }

    #[test]
    fn begin_stop_signals_worker_once() {
        let registry = SessionRegistry::new();
        registry.register(reserve("room1", "a"));

        let ticket = registry.begin_stop("room1").expect("live session");
        assert_eq!(ticket.session_id, "a");
        assert_eq!(registry.lookup("room1").unwrap().state, SessionState::Stopping);
        assert!(registry.begin_stop("room1").is_none());
        assert!(registry.begin_stop("room2").is_none());
    }

    #[test]
    fn reclaim_terminates_relay_and_releases_channel() {
        let registry = SessionRegistry::new();
        registry.register(reserve("room1", "a"));
        let ticket = registry.begin_stop("room1").unwrap();

        assert!(registry.reclaim("room1", "a"));
        assert!(ticket.finished.is_cancelled());
        assert!(!registry.contains("room1"));
        assert!(!registry.reclaim("room1", "a"));
    }

    #[test]
    fn channels_for_client_filters_by_owner() {
        let registry = SessionRegistry::new();
        registry.register(ChannelSession::reserve("room1", "a", ClientAddress(1)));
        registry.register(ChannelSession::reserve("room2", "b", ClientAddress(2)));
        registry.register(ChannelSession::reserve("room3", "c", ClientAddress(1)));

        let mut owned = registry.channels_for_client(ClientAddress(1));
        owned.sort();
        assert_eq!(owned, vec!["room1", "room3"]);
        assert_eq!(registry.summaries().len(), 3);
    }
}
