//! Application state

use std::sync::Arc;
use std::time::Duration;

use voicedock_protocol::ChannelCredentials;

use crate::credentials::{welcome_credentials, CredentialError, CredentialIssuer};
use crate::orchestrator::Orchestrator;
use crate::transport::ConnectionHub;

/// Shared by every connection (cheap to Clone)
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub hub: Arc<ConnectionHub>,
    issuer: Option<Arc<dyn CredentialIssuer>>,
    token_ttl: Duration,
    /// Stop a client's sessions when its socket closes
    pub stop_on_disconnect: bool,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, hub: Arc<ConnectionHub>) -> Self {
        Self {
            orchestrator,
            hub,
            issuer: None,
            token_ttl: crate::credentials::DEFAULT_TOKEN_TTL,
            stop_on_disconnect: true,
        }
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CredentialIssuer>, token_ttl: Duration) -> Self {
        self.issuer = Some(issuer);
        self.token_ttl = token_ttl;
        self
    }

    pub fn with_stop_on_disconnect(mut self, stop: bool) -> Self {
        self.stop_on_disconnect = stop;
        self
    }

    /// Credentials for the `welcome` message, if an issuer is configured
    pub fn welcome_credentials(&self) -> Option<Result<ChannelCredentials, CredentialError>> {
        self.issuer
            .as_deref()
            .map(|issuer| welcome_credentials(issuer, self.token_ttl))
    }
}
