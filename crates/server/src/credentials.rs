//! Channel credentials handed to clients in the `welcome` message.
//!
//! `HmacCredentialIssuer` signs `{channel, uid, exp}` with HMAC-SHA256 keyed by
//! the app certificate. Tokens are `base64url(claims).base64url(tag)`. This is
//! a local issuer for development and tests, not the media provider's format.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voicedock_protocol::ChannelCredentials;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("app certificate is empty")]
    EmptyCertificate,
    #[error("random source failed")]
    Random,
    #[error("failed to encode claims: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Expiry as an absolute unix time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenExpiry(pub u64);

impl TokenExpiry {
    pub fn after(ttl: Duration) -> Self {
        Self(unix_now() + ttl.as_secs())
    }
}

pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, channel_name: &str, uid: u32, expiry: TokenExpiry)
        -> Result<String, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Claims {
    channel: String,
    uid: u32,
    exp: u64,
}

pub struct HmacCredentialIssuer {
    app_id: String,
    key: hmac::Key,
}

impl HmacCredentialIssuer {
    pub fn new(app_id: &str, app_cert: &str) -> Result<Self, CredentialError> {
        if app_cert.trim().is_empty() {
            return Err(CredentialError::EmptyCertificate);
        }
        Ok(Self {
            app_id: app_id.to_string(),
            key: hmac::Key::new(hmac::HMAC_SHA256, app_cert.as_bytes()),
        })
    }

    fn signing_input(&self, encoded_claims: &str) -> Vec<u8> {
        let mut input = Vec::with_capacity(self.app_id.len() + 1 + encoded_claims.len());
        input.extend_from_slice(self.app_id.as_bytes());
        input.push(b'.');
        input.extend_from_slice(encoded_claims.as_bytes());
        input
    }

    /// Check a token's signature and expiry; returns (channel, uid).
    #[allow(dead_code)]
    pub fn verify(&self, token: &str) -> Result<(String, u32), CredentialError> {
        let (claims_b64, tag_b64) = token.split_once('.').ok_or(CredentialError::Malformed)?;
        let tag = B64.decode(tag_b64).map_err(|_| CredentialError::Malformed)?;
        hmac::verify(&self.key, &self.signing_input(claims_b64), &tag)
            .map_err(|_| CredentialError::BadSignature)?;

        let raw = B64.decode(claims_b64).map_err(|_| CredentialError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| CredentialError::Malformed)?;
        if claims.exp <= unix_now() {
            return Err(CredentialError::Expired);
        }
        Ok((claims.channel, claims.uid))
    }
}

impl CredentialIssuer for HmacCredentialIssuer {
    fn issue(
        &self,
        channel_name: &str,
        uid: u32,
        expiry: TokenExpiry,
    ) -> Result<String, CredentialError> {
        let claims = Claims {
            channel: channel_name.to_string(),
            uid,
            exp: expiry.0,
        };
        let claims_b64 = B64.encode(serde_json::to_vec(&claims)?);
        let tag = hmac::sign(&self.key, &self.signing_input(&claims_b64));
        Ok(format!("{claims_b64}.{}", B64.encode(tag.as_ref())))
    }
}

/// Fresh random channel + uid for a newly connected client.
pub fn welcome_credentials(
    issuer: &dyn CredentialIssuer,
    ttl: Duration,
) -> Result<ChannelCredentials, CredentialError> {
    let rng = SystemRandom::new();
    let mut uid_bytes = [0u8; 4];
    rng.fill(&mut uid_bytes).map_err(|_| CredentialError::Random)?;
    // Zero is reserved by the media provider for "assign one for me".
    let uid = u32::from_be_bytes(uid_bytes).max(1);

    let simple = uuid::Uuid::new_v4().simple().to_string();
    let channel_name = format!("channel-{}", &simple[..12]);
    let expiry = TokenExpiry::after(ttl);
    let token = issuer.issue(&channel_name, uid, expiry)?;

    Ok(ChannelCredentials {
        channel_name,
        uid,
        token,
        expires_at: expiry.0,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> HmacCredentialIssuer {
        HmacCredentialIssuer::new("app-123", "cert-abc").unwrap()
    }

    #[test]
    fn issued_token_verifies() {
        let issuer = issuer();
        let token = issuer
            .issue("room1", 42, TokenExpiry::after(Duration::from_secs(60)))
            .unwrap();

        assert_eq!(issuer.verify(&token).unwrap(), ("room1".to_string(), 42));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let issuer = issuer();
        let token = issuer
            .issue("room1", 42, TokenExpiry::after(Duration::from_secs(60)))
            .unwrap();
        let (_, tag) = token.split_once('.').unwrap();
        let forged_claims = B64.encode(
            serde_json::to_vec(&Claims {
                channel: "room2".into(),
                uid: 42,
                exp: u64::MAX,
            })
            .unwrap(),
        );

        let err = issuer.verify(&format!("{forged_claims}.{tag}")).unwrap_err();
        assert!(matches!(err, CredentialError::BadSignature));
    }

    #[test]
    fn token_from_another_certificate_is_rejected() {
        let other = HmacCredentialIssuer::new("app-123", "cert-xyz").unwrap();
        let token = other
            .issue("room1", 42, TokenExpiry::after(Duration::from_secs(60)))
            .unwrap();

        assert!(matches!(
            issuer().verify(&token),
            Err(CredentialError::BadSignature)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = issuer();
        let token = issuer.issue("room1", 42, TokenExpiry(1)).unwrap();
        assert!(matches!(issuer.verify(&token), Err(CredentialError::Expired)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            issuer().verify("not-a-token"),
            Err(CredentialError::Malformed)
        ));
    }

    #[test]
    fn empty_certificate_is_refused() {
        assert!(matches!(
            HmacCredentialIssuer::new("app-123", "  "),
            Err(CredentialError::EmptyCertificate)
        ));
    }

    #[test]
    fn welcome_credentials_are_random_and_signed() {
        let issuer = issuer();
        let a = welcome_credentials(&issuer, Duration::from_secs(60)).unwrap();
        let b = welcome_credentials(&issuer, Duration::from_secs(60)).unwrap();

        assert_ne!(a.channel_name, b.channel_name);
        assert!(a.uid >= 1);
        assert!(a.expires_at > unix_now());
        assert_eq!(
            issuer.verify(&a.token).unwrap(),
            (a.channel_name.clone(), a.uid)
        );
    }
}
