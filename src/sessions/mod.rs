//! Session token bookkeeping.
//!
//! [`SessionRegistry`] is the single authority over session tokens. A token
//! lives in exactly one of two maps:
//!
//! - **latent**: issued with an index page, never used to connect yet.
//!   Holds the request metadata of the page load.
//! - **active**: bound to a live [`Session`], connected or waiting for a
//!   reconnect. Tracks the last client interaction for expiry.
//!
//! Promotion removes the token from the latent map, so a latent token admits
//! exactly one fresh session. Reconnects find the token in the active map.
//!
//! ## Concurrency
//!
//! Both maps sit behind one `RwLock` so a token can never be observed in both.
//! Session shutdown (which awaits user hooks) always happens after the entry
//! has been removed and the lock released.

pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GateError;
use crate::util::{new_token, token_prefix};
use session::Session;

/// What the client sent with the request that produced a token.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Request URI as received (path and query).
    pub url: String,
    pub client_addr: Option<SocketAddr>,
    /// Header names are lowercase. Repeated headers keep the last value.
    pub headers: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn from_parts(uri: &Uri, headers: &HeaderMap, client_addr: Option<SocketAddr>) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            url: uri.to_string(),
            client_addr,
            headers,
        }
    }

    /// Metadata for a bare path with no headers.
    pub fn for_path(path: &str) -> Self {
        Self {
            url: path.to_string(),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    pub fn path(&self) -> &str {
        crate::util::url_path(&self.url)
    }
}

/// A token handed out with an index page.
#[derive(Debug, Clone)]
pub struct LatentEntry {
    pub request: RequestMetadata,
    pub issued_at: Instant,
}

struct ActiveEntry {
    session: Arc<Session>,
    last_interaction: Instant,
}

#[derive(Default)]
struct Maps {
    latent: HashMap<String, LatentEntry>,
    active: HashMap<String, ActiveEntry>,
}

/// Outcome of presenting a token on the websocket endpoint.
pub enum Promotion {
    /// Latent token: the caller builds a new session from the entry.
    Fresh(LatentEntry),
    /// Token of an existing session: the caller resumes it.
    Resume(Arc<Session>),
}

/// Summary of a reaper pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub sessions_closed: usize,
    pub latent_dropped: usize,
}

/// Owner of the latent and active token maps.
///
/// Cloneable; all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Maps>>,
}

/// Non-owning handle to a registry, held by background tasks that must not
/// keep the registry alive.
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<RwLock<Maps>>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<SessionRegistry> {
        self.inner.upgrade().map(|inner| SessionRegistry { inner })
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Issue a fresh token for a page load and store it as latent.
    pub async fn issue_latent(&self, request: RequestMetadata) -> String {
        let mut maps = self.inner.write().await;
        loop {
            let token = new_token();
            if maps.latent.contains_key(&token) || maps.active.contains_key(&token) {
                continue;
            }
            maps.latent.insert(
                token.clone(),
                LatentEntry {
                    request,
                    issued_at: Instant::now(),
                },
            );
            return token;
        }
    }

    /// Register a caller-chosen latent token.
    pub async fn register_latent(
        &self,
        token: String,
        request: RequestMetadata,
    ) -> Result<(), GateError> {
        let mut maps = self.inner.write().await;
        if maps.latent.contains_key(&token) || maps.active.contains_key(&token) {
            return Err(GateError::TokenInUse);
        }
        maps.latent.insert(
            token,
            LatentEntry {
                request,
                issued_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Consume a latent token, or find the session of an active one.
    ///
    /// A resumed session counts as an interaction.
    pub async fn promote(&self, token: &str) -> Result<Promotion, GateError> {
        let mut maps = self.inner.write().await;
        if let Some(entry) = maps.latent.remove(token) {
            return Ok(Promotion::Fresh(entry));
        }
        match maps.active.get_mut(token) {
            Some(entry) => {
                entry.last_interaction = Instant::now();
                Ok(Promotion::Resume(Arc::clone(&entry.session)))
            }
            None => Err(GateError::InvalidToken),
        }
    }

    /// Insert a newly built session under its token.
    pub async fn activate(&self, session: Arc<Session>) -> Result<(), GateError> {
        let mut maps = self.inner.write().await;
        let token = session.token().to_string();
        if maps.active.contains_key(&token) || maps.latent.contains_key(&token) {
            return Err(GateError::TokenInUse);
        }
        info!(
            token = token_prefix(&token),
            "Session activated, active: {}",
            maps.active.len() + 1
        );
        maps.active.insert(
            token,
            ActiveEntry {
                session,
                last_interaction: Instant::now(),
            },
        );
        Ok(())
    }

    /// Record a client interaction. Returns `false` for unknown tokens.
    pub async fn refresh(&self, token: &str) -> bool {
        match self.inner.write().await.active.get_mut(token) {
            Some(entry) => {
                entry.last_interaction = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.inner
            .read()
            .await
            .active
            .get(token)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Remove a session and close it, notifying the client.
    pub async fn close(&self, token: &str) -> Result<(), GateError> {
        let entry = self.inner.write().await.active.remove(token);
        match entry {
            Some(entry) => entry.session.close(true).await,
            None => Err(GateError::InvalidToken),
        }
    }

    /// Drop the map entry for `session` if it is still the one registered
    /// under its token. Used after a session closed itself.
    pub async fn forget(&self, session: &Arc<Session>) -> bool {
        let mut maps = self.inner.write().await;
        let same = maps
            .active
            .get(session.token())
            .is_some_and(|entry| Arc::ptr_eq(&entry.session, session));
        if same {
            maps.active.remove(session.token());
        }
        same
    }

    /// Close every session concurrently and forget all tokens. Failures are
    /// collected rather than aborting the shutdown.
    pub async fn close_all(&self) -> Vec<(String, GateError)> {
        let sessions: Vec<Arc<Session>> = {
            let mut maps = self.inner.write().await;
            maps.latent.clear();
            maps.active.drain().map(|(_, entry)| entry.session).collect()
        };
        if !sessions.is_empty() {
            info!("Closing {} session(s)", sessions.len());
        }
        let results =
            futures::future::join_all(sessions.iter().map(|session| session.close(true))).await;
        sessions
            .iter()
            .zip(results)
            .filter_map(|(session, result)| {
                result.err().map(|e| (session.token().to_string(), e))
            })
            .collect()
    }

    /// Close sessions idle for longer than `session_lifetime` (or already
    /// closed) and drop latent tokens older than `latent_lifetime`.
    pub async fn reap(
        &self,
        now: Instant,
        session_lifetime: Duration,
        latent_lifetime: Duration,
    ) -> ReapReport {
        let (expired, latent_dropped) = {
            let mut maps = self.inner.write().await;

            let before = maps.latent.len();
            maps.latent
                .retain(|_, entry| now.saturating_duration_since(entry.issued_at) <= latent_lifetime);
            let latent_dropped = before - maps.latent.len();

            let stale: Vec<String> = maps
                .active
                .iter()
                .filter(|(_, entry)| {
                    entry.session.is_closed()
                        || now.saturating_duration_since(entry.last_interaction) > session_lifetime
                })
                .map(|(token, _)| token.clone())
                .collect();
            let expired: Vec<Arc<Session>> = stale
                .iter()
                .filter_map(|token| maps.active.remove(token))
                .map(|entry| entry.session)
                .collect();
            (expired, latent_dropped)
        };

        for session in &expired {
            info!(token = token_prefix(session.token()), "Session expired");
            if let Err(e) = session.close(true).await {
                warn!(
                    token = token_prefix(session.token()),
                    "Error closing expired session: {e}"
                );
            }
        }

        ReapReport {
            sessions_closed: expired.len(),
            latent_dropped,
        }
    }

    pub async fn latent_count(&self) -> usize {
        self.inner.read().await.latent.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }
}
