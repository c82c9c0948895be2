//! Session registry: the single authority for which remote peer talks to
//! which duplex channel.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. Lookups from the POST path take a read
//! lock; inserts from the accept path and removals from the teardown path
//! take a write lock. Each operation is a single lock acquisition, so a lookup
//! never observes a half-inserted or half-removed entry. Entries are
//! `Arc<Session>`, so a caller holding one can keep using it after the
//! session has been removed; [`Session::state`] reports whether it is still
//! live.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RouteError, SessionError};
use crate::message::Message;
use crate::transport::sse::SseEndpoint;
use crate::transport::stdio::DuplexChannel;

/// Opaque session identifier, announced to the remote peer in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random (UUID v4) identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// One bound pairing of a streaming endpoint and a duplex channel.
pub struct Session {
    id: SessionId,
    endpoint: SseEndpoint,
    channel: Arc<DuplexChannel>,
    /// Queue feeding the inbound (remote to child) forwarding pump.
    inbound: mpsc::Sender<Message>,
    /// Fired on teardown; stops both pumps and ends the SSE response.
    cancel: CancellationToken,
    created_at: Instant,
}

impl Session {
    pub fn new(
        endpoint: SseEndpoint,
        channel: Arc<DuplexChannel>,
        inbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: endpoint.session_id().clone(),
            endpoint,
            channel,
            inbound,
            cancel,
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &SseEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<DuplexChannel> {
        &self.channel
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    #[must_use]
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Hand a POSTed message to the inbound pump, waiting for queue space.
    ///
    /// A session that closes while the message waits reports `NotFound`, the
    /// same as one that was never registered.
    pub async fn deliver(&self, message: Message) -> Result<(), RouteError> {
        if self.cancel.is_cancelled() {
            return Err(RouteError::NotFound(self.id.clone()));
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RouteError::NotFound(self.id.clone())),
            sent = self.inbound.send(message) => {
                sent.map_err(|_| RouteError::NotFound(self.id.clone()))
            }
        }
    }

    /// Stop both pumps and end the remote peer's stream. Idempotent.
    pub fn close_stream(&self) {
        self.cancel.cancel();
    }
}

/// Concurrent map from [`SessionId`] to [`Session`].
///
/// Clones share one map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails without replacing anything if the id is
    /// already taken.
    pub async fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(SessionError::Duplicate(session.id().clone()));
        }
        sessions.insert(session.id().clone(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Remove and return a session. `None` if it was already gone.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// Remove and return every session (used during shutdown).
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
