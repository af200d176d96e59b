use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::protocol::TokenPair;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::{cache::EntityCache, ConsoleEvent};

/// Claims the console reads from an access token. The signature is the
/// identity provider's concern; only presence and expiry are checked here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not logged in: no credential available")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("malformed credential: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Logout,
    AuthorizationRejected,
}

pub fn decode_claims(access_token: &str) -> Result<SessionClaims, SessionError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = true;
    validation.leeway = 0;
    jsonwebtoken::decode::<SessionClaims>(
        access_token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => SessionError::Expired,
        _ => SessionError::Malformed(err.to_string()),
    })
}

/// Where the credential pair lives between runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn save(&self, tokens: &TokenPair) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<Option<TokenPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            tokens: Mutex::new(Some(tokens)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn save(&self, tokens: &TokenPair) -> Result<()> {
        *self.tokens.lock().await = Some(tokens.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.tokens.lock().await.take();
        Ok(())
    }
}

/// JSON file holding the credential pair; used by the command-line console.
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

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read credentials '{}'", self.path.display())
                })
            }
        };
        let tokens = serde_json::from_slice(&raw).with_context(|| {
            format!("invalid credentials file '{}'", self.path.display())
        })?;
        Ok(Some(tokens))
    }

    async fn save(&self, tokens: &TokenPair) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!(
                    "failed to create parent directory '{}' for credentials",
                    parent.display()
                )
            })?;
        }
        let raw = serde_json::to_vec_pretty(tokens)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write credentials '{}'", self.path.display()))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove credentials '{}'", self.path.display())),
        }
    }
}

struct ActiveCredential {
    tokens: TokenPair,
    claims: SessionClaims,
}

/// Owns the credential for the running session and the lifetime of the
/// entity cache tied to it.
pub struct Session {
    store: Arc<dyn CredentialStore>,
    active: RwLock<Option<ActiveCredential>>,
    cache: EntityCache,
    events: broadcast::Sender<ConsoleEvent>,
}

impl Session {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cache: EntityCache,
        events: broadcast::Sender<ConsoleEvent>,
    ) -> Self {
        Self {
            store,
            active: RwLock::new(None),
            cache,
            events,
        }
    }

    /// Picks up a persisted credential from an earlier run if it is still
    /// usable; an expired or unreadable one is cleared.
    pub async fn restore(&self) -> Option<SessionClaims> {
        let tokens = match self.store.load().await {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return None,
            Err(err) => {
                warn!("session: failed to load stored credentials: {err:#}");
                return None;
            }
        };

        match decode_claims(&tokens.access) {
            Ok(claims) => {
                info!(user_id = claims.user_id, "session: restored stored credential");
                self.cache.discard();
                *self.active.write().await = Some(ActiveCredential {
                    tokens,
                    claims: claims.clone(),
                });
                Some(claims)
            }
            Err(err) => {
                warn!("session: stored credential unusable: {err}");
                if let Err(err) = self.store.clear().await {
                    warn!("session: failed to clear stored credentials: {err:#}");
                }
                None
            }
        }
    }

    /// Starts a fresh session with a newly issued credential pair.
    pub async fn begin(&self, tokens: TokenPair) -> Result<SessionClaims, SessionError> {
        let claims = decode_claims(&tokens.access)?;
        if let Err(err) = self.store.save(&tokens).await {
            warn!("session: failed to persist credentials: {err:#}");
        }
        self.cache.discard();
        *self.active.write().await = Some(ActiveCredential {
            tokens,
            claims: claims.clone(),
        });
        info!(user_id = claims.user_id, "session: started");
        let _ = self.events.send(ConsoleEvent::SessionStarted {
            user_id: claims.user_id,
        });
        Ok(claims)
    }

    /// Tears the session down: credentials cleared, cache discarded. Idempotent.
    pub async fn end(&self, reason: SessionEndReason) {
        let previous = self.active.write().await.take();
        if let Err(err) = self.store.clear().await {
            warn!("session: failed to clear stored credentials: {err:#}");
        }
        self.cache.discard();

        let Some(previous) = previous else {
            return;
        };
        match reason {
            SessionEndReason::Logout => {
                info!(user_id = previous.claims.user_id, "session: logged out")
            }
            SessionEndReason::AuthorizationRejected => warn!(
                user_id = previous.claims.user_id,
                "session: credential rejected by service, session ended"
            ),
        }
        let _ = self.events.send(ConsoleEvent::SessionEnded { reason });
    }

    /// Bearer credential for the next request.
    pub async fn bearer(&self) -> Result<String, SessionError> {
        let guard = self.active.read().await;
        let active = guard.as_ref().ok_or(SessionError::Missing)?;
        if active.claims.exp <= Utc::now().timestamp() {
            return Err(SessionError::Expired);
        }
        Ok(active.tokens.access.clone())
    }

    pub async fn claims(&self) -> Option<SessionClaims> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.claims.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.bearer().await.is_ok()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
