//! Session store: token → session registry with sliding expiry
//!
//! Sessions are created, bound, refreshed and removed only by the hub.
//! Other tasks may call [`SessionStore::exists`] concurrently.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{CarrotError, CarrotResult};

/// Placeholder a client sends when it has no token yet
pub const NIL_TOKEN: &str = "nil";

/// Opaque, globally unique session identifier. Minted by the hub only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random token (hyphenless UUIDv4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty token and the literal `"nil"` placeholder.
    pub fn is_nil(&self) -> bool {
        self.0.is_empty() || self.0 == NIL_TOKEN
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-side record of one client's continuity.
#[derive(Debug)]
pub struct Session {
    pub token: SessionToken,
    pub created_at: DateTime<Utc>,
    expire_time: Instant,
    client: Weak<Client>,
}

impl Session {
    fn new(token: SessionToken, ttl: Duration) -> Self {
        Self {
            token,
            created_at: Utc::now(),
            expire_time: Instant::now() + ttl,
            client: Weak::new(),
        }
    }

    pub fn expire_time(&self) -> Instant {
        self.expire_time
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expire_time
    }

    /// Push the deadline out to `now + ttl`. Never moves it backwards.
    pub fn refresh(&mut self, ttl: Duration) {
        let next = Instant::now() + ttl;
        if next > self.expire_time {
            self.expire_time = next;
        }
    }

    /// Time since the session was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// The bound connection, if it is still alive
    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    fn bind(&mut self, client: &Arc<Client>) {
        self.client = Arc::downgrade(client);
    }
}

/// Registry of live sessions.
pub trait SessionStore: Send + Sync {
    /// Whether a session with this token is registered
    fn exists(&self, token: &SessionToken) -> bool;

    /// Mint a fresh unique token and register an unbound session for it
    fn new_session(&self) -> CarrotResult<SessionToken>;

    /// Whether the session is registered but its TTL has lapsed. Such a
    /// session is still present until the next broadcast sweep removes it.
    fn is_expired(&self, token: &SessionToken) -> bool;

    /// Associate a connection with the session, creating it if absent.
    /// Nil tokens are refused.
    fn bind(&self, token: &SessionToken, client: &Arc<Client>) -> CarrotResult<()>;

    /// Remove a session. Removing an unknown token is a no-op.
    fn delete(&self, token: &SessionToken);

    /// Visit every session until the visitor returns `false`.
    ///
    /// Iterates over a snapshot, so the visitor may call [`SessionStore::delete`]
    /// for the session it is looking at.
    fn range(&self, visitor: &mut dyn FnMut(&mut Session) -> bool);

    /// Number of registered sessions
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type TokenGenerator = Box<dyn Fn() -> SessionToken + Send + Sync>;

/// Default [`SessionStore`] backed by a sharded concurrent map.
pub struct DefaultSessionStore {
    sessions: DashMap<SessionToken, Arc<Mutex<Session>>>,
    ttl: Duration,
    max_attempts: usize,
    generator: TokenGenerator,
}

impl DefaultSessionStore {
    pub fn new(ttl: Duration, max_attempts: usize) -> Self {
        Self::with_generator(ttl, max_attempts, Box::new(SessionToken::generate))
    }

    /// Store with a custom token source
    pub fn with_generator(ttl: Duration, max_attempts: usize, generator: TokenGenerator) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_attempts: max_attempts.max(1),
            generator,
        }
    }

    /// Expiry deadline of a session, if registered
    pub fn expire_time(&self, token: &SessionToken) -> Option<Instant> {
        self.sessions.get(token).map(|entry| {
            let expire = lock(entry.value()).expire_time();
            expire
        })
    }
}

impl fmt::Debug for DefaultSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultSessionStore")
            .field("sessions", &self.sessions.len())
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl SessionStore for DefaultSessionStore {
    fn exists(&self, token: &SessionToken) -> bool {
        !token.is_nil() && self.sessions.contains_key(token)
    }

    fn new_session(&self) -> CarrotResult<SessionToken> {
        for attempt in 1..=self.max_attempts {
            let token = (self.generator)();
            if token.is_nil() {
                continue;
            }
            match self.sessions.entry(token.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Mutex::new(Session::new(token.clone(), self.ttl))));
                    info!(session_token = %token, "session created");
                    return Ok(token);
                }
                Entry::Occupied(_) => {
                    debug!(attempt, "generated token collided with a live session");
                }
            }
        }
        warn!(attempts = self.max_attempts, "token generation exhausted");
        Err(CarrotError::TokenGeneration(self.max_attempts))
    }

    fn is_expired(&self, token: &SessionToken) -> bool {
        self.sessions
            .get(token)
            .is_some_and(|entry| {
                let expired = lock(entry.value()).is_expired();
                expired
            })
    }

    fn bind(&self, token: &SessionToken, client: &Arc<Client>) -> CarrotResult<()> {
        if token.is_nil() {
            warn!(client_id = client.id(), "refusing to bind a nil session token");
            return Err(CarrotError::SessionInvalid(token.to_string()));
        }
        let session = self
            .sessions
            .entry(token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(token.clone(), self.ttl))))
            .value()
            .clone();
        lock(&session).bind(client);
        client.set_session(token.clone());
        debug!(session_token = %token, client_id = client.id(), "client bound to session");
        Ok(())
    }

    fn delete(&self, token: &SessionToken) {
        if self.sessions.remove(token).is_some() {
            debug!(session_token = %token, "session removed");
        }
    }

    fn range(&self, visitor: &mut dyn FnMut(&mut Session) -> bool) {
        let snapshot: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for session in snapshot {
            let mut guard = lock(&session);
            if !visitor(&mut guard) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

fn lock(session: &Mutex<Session>) -> std::sync::MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
