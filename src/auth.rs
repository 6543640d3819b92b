//! Private-channel authentication.
//!
//! An [`AuthSession`] signs a login payload with the account secret and a
//! process-wide monotonic nonce, then tracks the exchange's acknowledgement.
//! The exact message layout and digest are supplied per exchange through an
//! [`AuthScheme`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{Result, TickmuxError};

/// Tracks the last nonce issued so every call returns a strictly
/// increasing value even when the wall-clock hasn't advanced.
///
/// Shared by every session in the process, so a session recreated after a
/// reconnect can never reuse a nonce.
static LAST_NONCE: AtomicU64 = AtomicU64::new(0);

/// API key and secret. The secret is wiped from memory on drop.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// HMAC digest used for the login signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Sha256,
    Sha384,
    Sha512,
}

/// Text encoding of the signature bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// How the configured secret string maps to HMAC key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretEncoding {
    /// The secret's UTF-8 bytes are the key.
    Raw,
    /// The secret is base64 and must be decoded first.
    Base64,
}

/// Per-exchange description of the signed login message.
///
/// The signed message is `nonce ++ method ++ path ++ body`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthScheme {
    pub method: &'static str,
    pub path: &'static str,
    pub body: &'static str,
    pub digest: Digest,
    pub encoding: SignatureEncoding,
    pub secret_encoding: SecretEncoding,
}

impl AuthScheme {
    /// Builds the message that gets signed for `nonce`.
    pub fn message(&self, nonce: i64) -> String {
        format!("{nonce}{}{}{}", self.method, self.path, self.body)
    }
}

/// Signed login material handed to the profile for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPayload {
    pub api_key: String,
    pub nonce: i64,
    pub signature: String,
}

/// Handshake state of one connection's authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Pending,
    Authenticated,
    Failed,
}

/// Authentication state for one connection.
///
/// A new session is created for every connection; it is never carried
/// across a reconnect.
#[derive(Debug)]
pub struct AuthSession {
    credentials: Credentials,
    state: AuthState,
    last_nonce: Option<i64>,
}

impl AuthSession {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Unauthenticated,
            last_nonce: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Nonce used by the most recent login attempt.
    pub fn last_nonce(&self) -> Option<i64> {
        self.last_nonce
    }

    /// Signs a fresh login payload and moves the session to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`TickmuxError::Authentication`] if the secret cannot be
    /// decoded into a key.
    pub fn build_login_payload(&mut self, scheme: &AuthScheme) -> Result<LoginPayload> {
        if self.state == AuthState::Pending {
            warn!("Rebuilding login payload while a login is already pending");
        }
        let nonce = next_nonce();
        let signature = sign(self.credentials.secret(), &scheme.message(nonce), scheme)?;
        self.last_nonce = Some(nonce);
        self.state = AuthState::Pending;
        Ok(LoginPayload {
            api_key: self.credentials.api_key.clone(),
            nonce,
            signature,
        })
    }

    /// Records the exchange's answer to the login request.
    ///
    /// Acks that arrive when no login is pending are ignored.
    pub fn on_login_ack(&mut self, success: bool) -> AuthState {
        if self.state != AuthState::Pending {
            warn!(state = ?self.state, success, "Ignoring unexpected login acknowledgement");
            return self.state;
        }
        self.state = if success {
            info!("Authenticated");
            AuthState::Authenticated
        } else {
            warn!("Login rejected");
            AuthState::Failed
        };
        self.state
    }

    /// Gives up on a pending login, e.g. after a timeout.
    pub fn fail(&mut self) {
        self.state = AuthState::Failed;
    }
}

/// Returns a strictly increasing nonce in milliseconds since the epoch.
///
/// Uses the wall-clock as the baseline but guarantees that successive calls
/// always return a value larger than the previous one, even when several
/// logins happen within the same millisecond or the clock steps backwards.
pub fn next_nonce() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_NONCE.load(Ordering::Relaxed);
    loop {
        let nonce = now.max(prev + 1);
        match LAST_NONCE.compare_exchange_weak(prev, nonce, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return nonce as i64,
            Err(actual) => prev = actual,
        }
    }
}

/// Computes `encoding(HMAC-digest(key(secret), message))`.
///
/// # Errors
///
/// Returns [`TickmuxError::Authentication`] if a base64 secret is invalid.
pub fn sign(secret: &str, message: &str, scheme: &AuthScheme) -> Result<String> {
    let key = match scheme.secret_encoding {
        SecretEncoding::Raw => Zeroizing::new(secret.as_bytes().to_vec()),
        SecretEncoding::Base64 => Zeroizing::new(BASE64_STANDARD.decode(secret).map_err(|e| {
            TickmuxError::Authentication(format!("invalid base64 api secret: {e}"))
        })?),
    };

    let raw = match scheme.digest {
        Digest::Sha256 => hmac_bytes::<Hmac<Sha256>>(&key, message)?,
        Digest::Sha384 => hmac_bytes::<Hmac<Sha384>>(&key, message)?,
        Digest::Sha512 => hmac_bytes::<Hmac<Sha512>>(&key, message)?,
    };

    Ok(match scheme.encoding {
        SignatureEncoding::Hex => hex::encode(raw),
        SignatureEncoding::Base64 => BASE64_STANDARD.encode(raw),
    })
}

fn hmac_bytes<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &str) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| TickmuxError::Authentication(format!("invalid HMAC key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEME: AuthScheme = AuthScheme {
        method: "GET",
        path: "/ws/auth",
        body: "",
        digest: Digest::Sha384,
        encoding: SignatureEncoding::Hex,
        secret_encoding: SecretEncoding::Raw,
    };

    #[test]
    fn sign_matches_known_hmac_sha384() {
        let message = SCHEME.message(1_700_000_000_000);
        assert_eq!(message, "1700000000000GET/ws/auth");
        assert_eq!(
            sign("secret", &message, &SCHEME).unwrap(),
            "bd440ec98e3214d4f449196136a1904cc76c956da100313f084f029743056e4c\
             0eef3a11eafc422b06f93c29d3d3df8a"
        );
    }

    #[test]
    fn sign_supports_base64_output_and_secret() {
        let scheme = AuthScheme {
            method: "",
            path: "",
            body: "",
            digest: Digest::Sha256,
            encoding: SignatureEncoding::Base64,
            secret_encoding: SecretEncoding::Base64,
        };
        assert_eq!(
            sign("c2VjcmV0", "1700000000000", &scheme).unwrap(),
            "T+LOEv1r7F4GSLI7+/8Vi6X8GLOiFLTCBzFGcUSKleE="
        );
    }

    #[test]
    fn sign_includes_body_in_message() {
        let scheme = AuthScheme {
            method: "POST",
            path: "/auth",
            body: "{\"a\":1}",
            digest: Digest::Sha512,
            ..SCHEME
        };
        assert_eq!(
            sign("secret", &scheme.message(1_700_000_000_000), &scheme).unwrap(),
            "de83669182645bd6202c1a44aa0c68fce39a86498bf8ce295f0bd07cde0d6250\
             475b87ec7fd28f171afe7887e5ea6f94afd250398b80307d68a72a34baa069d9"
        );
    }

    #[test]
    fn sign_rejects_invalid_base64_secret() {
        let scheme = AuthScheme {
            secret_encoding: SecretEncoding::Base64,
            ..SCHEME
        };
        assert!(matches!(
            sign("not-valid-base64!!!", "1", &scheme),
            Err(TickmuxError::Authentication(_))
        ));
    }

    #[test]
    fn next_nonce_is_strictly_monotonic() {
        let mut prev = next_nonce();
        for _ in 0..1_000 {
            let current = next_nonce();
            assert!(current > prev, "nonce did not increase: {prev} -> {current}");
            prev = current;
        }
    }

    #[test]
    fn login_handshake_transitions() {
        let mut session = AuthSession::new(Credentials::new("key", "secret"));
        assert_eq!(session.state(), AuthState::Unauthenticated);

        let payload = session.build_login_payload(&SCHEME).unwrap();
        assert_eq!(payload.api_key, "key");
        assert_eq!(session.state(), AuthState::Pending);
        assert_eq!(session.last_nonce(), Some(payload.nonce));

        assert_eq!(session.on_login_ack(true), AuthState::Authenticated);
        assert!(session.is_authenticated());
        // A stray ack does not change an established session.
        assert_eq!(session.on_login_ack(false), AuthState::Authenticated);
    }

    #[test]
    fn failed_login_can_be_retried_with_fresh_nonce() {
        let mut session = AuthSession::new(Credentials::new("key", "secret"));
        let first = session.build_login_payload(&SCHEME).unwrap();
        assert_eq!(session.on_login_ack(false), AuthState::Failed);

        let second = session.build_login_payload(&SCHEME).unwrap();
        assert!(second.nonce > first.nonce);
        assert_ne!(second.signature, first.signature);
    }

    #[test]
    fn recreated_session_never_reuses_nonce() {
        let mut first = AuthSession::new(Credentials::new("key", "secret"));
        let a = first.build_login_payload(&SCHEME).unwrap().nonce;
        let mut second = AuthSession::new(Credentials::new("key", "secret"));
        let b = second.build_login_payload(&SCHEME).unwrap().nonce;
        assert!(b > a);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let creds = Credentials::new("key", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("key"));
        assert!(!debug.contains("hunter2"));
    }
}
