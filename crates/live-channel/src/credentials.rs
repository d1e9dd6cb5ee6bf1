//! Credential storage seam.
//!
//! The manager only needs three things from the session layer: the current
//! token, whether it is still usable, and a way to forget it. Tokens that are
//! JWTs are checked against their `exp` claim; anything else is treated as
//! non-expiring on the client side.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::CredentialError;

/// An opaque access token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expiry from the JWT `exp` claim, if the token is a JWT that has one.
    pub fn expires_at(&self) -> Option<SystemTime> {
        #[derive(Deserialize)]
        struct Claims {
            exp: Option<u64>,
        }

        let payload = self.0.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: Claims = serde_json::from_slice(&bytes).ok()?;
        claims
            .exp
            .map(|exp| UNIX_EPOCH + Duration::from_secs(exp))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .is_some_and(|exp| exp <= SystemTime::now())
    }

    /// `Ok(self)` when usable, otherwise the reason it is not.
    pub fn check(self) -> Result<Self, CredentialError> {
        if self.0.is_empty() {
            Err(CredentialError::Missing)
        } else if self.is_expired() {
            Err(CredentialError::Expired)
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Where the manager and fetchers read credentials from.
pub trait CredentialStore: Send + Sync {
    fn token(&self) -> Option<Token>;

    fn is_valid(&self) -> bool {
        self.current().is_ok()
    }

    fn clear(&self);

    /// The current token if usable.
    fn current(&self) -> Result<Token, CredentialError> {
        self.token().ok_or(CredentialError::Missing)?.check()
    }
}

/// Credentials held in process memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<Token>>,
}

impl MemoryCredentialStore {
    pub fn new(token: Option<Token>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Token) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<Token> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// A token kept in a plain-text file, re-read on every access so an external
/// login flow can replace it while we run.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn token(&self) -> Option<Token> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let value = content.trim();
                (!value.is_empty()).then(|| Token::new(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to read token file: {e}");
                None
            }
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Token file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to remove token file: {e}");
            }
        }
    }
}
