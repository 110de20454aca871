//! Identity Service
//!
//! Process-wide login state: the rotating login phrases handed out to
//! clients, signature verification of signed phrases, and the session
//! table. Constructed once at startup and initialized with the keys that
//! may log in.

use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use rand::Rng;
use tokio::sync::watch;

use super::session::SessionStore;
use crate::config::AuthConfig;
use crate::error::{Error, Result};

const TIMESTAMP_LEN: usize = 13;
const PHRASE_MIN_LEN: usize = 40;
const PHRASE_MAX_LEN: usize = 70;
const PHRASE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Checks a signature over a login phrase
pub trait SignatureVerifier: Send + Sync {
    /// Whether `signature` (base64) is a valid signature of `message` by any accepted key
    fn verify(&self, message: &[u8], signature: &str) -> bool;
}

/// Ed25519 keys accepted for login, owner first
pub struct Ed25519Verifier {
    keys: Vec<VerifyingKey>,
}

impl Ed25519Verifier {
    /// Parse base64 public keys
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| parse_public_key(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Owner key followed by the admin keys from configuration
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let keys: Vec<&str> = config
            .owner_key
            .iter()
            .chain(config.admin_keys.iter())
            .map(String::as_str)
            .collect();
        Self::from_keys(&keys)
    }

    /// Number of accepted keys
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Ok(bytes) = BASE64.decode(signature.trim()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        self.keys.iter().any(|key| key.verify(message, &signature).is_ok())
    }
}

fn parse_public_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Config(format!("Invalid public key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        Error::Config(format!("Invalid public key length: {} (expected 32)", b.len()))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Config(format!("Invalid public key: {}", e)))
}

/// Login phrases, signature checks and sessions
pub struct IdentityService {
    max_age: Duration,
    /// Current phrase first; the previous one stays valid until the next rotation
    phrases: RwLock<[String; 2]>,
    verifier: OnceLock<Box<dyn SignatureVerifier>>,
    sessions: SessionStore,
}

impl IdentityService {
    /// Create a new identity service. Logins fail until `init` is called.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            max_age: Duration::from_secs(config.login_max_age_secs),
            phrases: RwLock::new([generate_login_phrase(), generate_login_phrase()]),
            verifier: OnceLock::new(),
            sessions: SessionStore::new(Duration::from_secs(config.session_ttl_secs)),
        }
    }

    /// Install the keys that may log in
    pub fn init(&self, verifier: impl SignatureVerifier + 'static) -> Result<()> {
        self.verifier
            .set(Box::new(verifier))
            .map_err(|_| Error::Internal("Identity service already initialized".into()))
    }

    /// Phrase a client should sign to log in
    pub fn login_phrase(&self) -> String {
        self.read_phrases()[0].clone()
    }

    /// Replace the oldest phrase with a fresh one
    pub fn rotate_phrase(&self) {
        let mut phrases = self
            .phrases
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        phrases.swap(0, 1);
        phrases[0] = generate_login_phrase();
    }

    /// Rotate the login phrase every `period` until shutdown
    pub async fn rotate_phrases(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.rotate_phrase();
                    tracing::debug!("Login phrase rotated");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Check a signed login phrase
    pub fn verify_login(&self, phrase: &str, signature: &str) -> Result<()> {
        if !(PHRASE_MIN_LEN..=PHRASE_MAX_LEN).contains(&phrase.len()) {
            return Err(Error::Unauthorized("invalid login phrase".into()));
        }

        let issued = phrase
            .get(..TIMESTAMP_LEN)
            .and_then(|ts| ts.parse::<i64>().ok())
            .ok_or_else(|| Error::Unauthorized("invalid login phrase".into()))?;
        let now = Utc::now().timestamp_millis();
        let max_age = self.max_age.as_millis() as i64;
        if issued > now || issued < now - max_age {
            return Err(Error::Unauthorized("login phrase expired".into()));
        }

        let verifier = self
            .verifier
            .get()
            .ok_or_else(|| Error::Unauthorized("no login keys configured".into()))?;
        if !verifier.verify(phrase.as_bytes(), signature) {
            return Err(Error::Unauthorized("signature rejected".into()));
        }
        Ok(())
    }

    /// Verify a signed phrase and open a session bound to `identity`
    pub fn login(&self, phrase: &str, signature: &str, identity: &str) -> Result<String> {
        self.verify_login(phrase, signature)?;
        Ok(self.sessions.create(identity))
    }

    /// Session table
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn read_phrases(&self) -> std::sync::RwLockReadGuard<'_, [String; 2]> {
        self.phrases
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `<13-digit ms timestamp><random lowercase alphanumerics>`
fn generate_login_phrase() -> String {
    let mut rng = rand::thread_rng();
    let suffix_len = rng.gen_range(PHRASE_MIN_LEN - TIMESTAMP_LEN..=PHRASE_MAX_LEN - TIMESTAMP_LEN);
    let suffix: String = (0..suffix_len)
        .map(|_| PHRASE_CHARSET[rng.gen_range(0..PHRASE_CHARSET.len())] as char)
        .collect();
    format!("{:013}{}", Utc::now().timestamp_millis(), suffix)
}
