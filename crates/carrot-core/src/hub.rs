//! Broadcast hub: the single owner of session state
//!
//! One task multiplexes three mailboxes: register, unregister and broadcast.
//! Every session mutation happens on that task. Broadcast fan-out never
//! waits on a client: a client whose outbound queue is full is closed and
//! the sweep moves on.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, Delivery};
use crate::config::HubConfig;
use crate::error::{CarrotError, CarrotResult};
use crate::session::{DefaultSessionStore, SessionStore, SessionToken};

/// Registration request sent by a connection before its pumps start
struct Registration {
    client: Arc<Client>,
    requested: Option<SessionToken>,
    reply: oneshot::Sender<CarrotResult<SessionToken>>,
}

/// Counts gathered during one broadcast sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions whose TTL had lapsed and were removed
    pub expired: usize,
    /// Sessions skipped because their client is gone or closed
    pub closed: usize,
    /// Sessions whose expiry was pushed forward
    pub refreshed: usize,
    /// Messages handed to an outbound queue
    pub delivered: usize,
    /// Clients closed because their outbound queue was full
    pub shed: usize,
}

/// The hub actor. Create with [`Hub::new`], then drive with [`Hub::run`].
pub struct Hub {
    sessions: Arc<dyn SessionStore>,
    config: Arc<HubConfig>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Arc<Client>>,
    broadcast_rx: mpsc::Receiver<Arc<str>>,
}

/// Cloneable handle for talking to a running hub
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Arc<Client>>,
    broadcast_tx: mpsc::Sender<Arc<str>>,
    sessions: Arc<dyn SessionStore>,
}

impl Hub {
    /// Create a hub with the default session store
    pub fn new(config: Arc<HubConfig>) -> (Self, HubHandle) {
        let store = DefaultSessionStore::new(config.session_ttl(), config.token_attempts);
        Self::with_store(config, Arc::new(store))
    }

    /// Create a hub over a caller-supplied session store
    pub fn with_store(config: Arc<HubConfig>, sessions: Arc<dyn SessionStore>) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.register_buffer.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(config.register_buffer.max(1));
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_buffer.max(1));

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            sessions: sessions.clone(),
        };
        let hub = Self {
            sessions,
            config,
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        (hub, handle)
    }

    /// Run the event loop until cancelled. Open clients are closed on exit.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            broadcast_buffer = self.config.broadcast_buffer,
            session_ttl_secs = self.config.session_ttl_secs,
            "hub started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("hub shutting down");
                    break;
                }
                Some(registration) = self.register_rx.recv() => {
                    let Registration { client, requested, reply } = registration;
                    let result = self.register(&client, requested);
                    if reply.send(result).is_err() {
                        debug!(client_id = client.id(), "registering connection went away");
                        self.unregister(&client);
                    }
                }
                Some(client) = self.unregister_rx.recv() => {
                    self.unregister(&client);
                }
                Some(message) = self.broadcast_rx.recv() => {
                    self.broadcast_all(message);
                }
            }
        }

        self.close_all();
    }

    /// Spawn the event loop on the runtime
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Open the client and bind it to a session, minting a token when the
    /// requested one is absent, `"nil"`, unknown, or past its TTL. An expired
    /// session is left for the next sweep to remove. A minted token is
    /// queued on the client's token queue before the client is bound, so it
    /// precedes any broadcast traffic.
    pub(crate) fn register(
        &self,
        client: &Arc<Client>,
        requested: Option<SessionToken>,
    ) -> CarrotResult<SessionToken> {
        client.mark_open();

        let resumable = match requested {
            Some(token) if token.is_nil() => None,
            Some(token) if self.sessions.exists(&token) && !self.sessions.is_expired(&token) => {
                Some(token)
            }
            Some(token) if self.sessions.exists(&token) => {
                let reason = CarrotError::SessionExpired(token.to_string());
                debug!(client_id = client.id(), error = %reason, "minting a fresh session");
                None
            }
            Some(token) => {
                let reason = CarrotError::SessionInvalid(token.to_string());
                debug!(client_id = client.id(), error = %reason, "minting a fresh session");
                None
            }
            None => None,
        };
        let token = match resumable {
            Some(token) => {
                debug!(client_id = client.id(), session_token = %token, "resuming session");
                token
            }
            None => {
                let token = match self.sessions.new_session() {
                    Ok(token) => token,
                    Err(e) => {
                        error!(client_id = client.id(), error = %e, "could not create session");
                        client.close();
                        return Err(e);
                    }
                };
                if !client.send_token(token.clone()) {
                    warn!(client_id = client.id(), session_token = %token, "token queue unavailable");
                }
                token
            }
        };

        if let Err(e) = self.sessions.bind(&token, client) {
            error!(client_id = client.id(), error = %e, "could not bind session");
            client.close();
            return Err(e);
        }
        Ok(token)
    }

    /// Close the client's outbound queues if it is still open.
    pub(crate) fn unregister(&self, client: &Client) {
        if client.close() {
            debug!(client_id = client.id(), session = ?client.session(), "client unregistered");
        }
    }

    /// Walk every session: drop expired ones, skip closed clients, refresh
    /// and deliver to the rest.
    pub fn broadcast_all(&self, message: Arc<str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let ttl = self.config.session_ttl();
        let sessions = &self.sessions;

        sessions.range(&mut |session| {
            if session.is_expired() {
                let reason = CarrotError::SessionExpired(session.token.to_string());
                debug!(
                    error = %reason,
                    age_secs = session.age().num_seconds(),
                    "dropping idle session"
                );
                report.expired += 1;
                sessions.delete(&session.token);
                return true;
            }

            let client = match session.client() {
                Some(client) if client.is_open() => client,
                _ => {
                    report.closed += 1;
                    return true;
                }
            };

            session.refresh(ttl);
            report.refreshed += 1;

            match client.try_deliver(message.clone()) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Full => {
                    warn!(
                        session_token = %session.token,
                        queued = client.queued(),
                        error = %CarrotError::QueueOverflow(client.id()),
                        "dropping slow client"
                    );
                    client.close();
                    report.shed += 1;
                }
                Delivery::Closed => {
                    client.close();
                    report.closed += 1;
                }
            }
            true
        });

        debug!(
            expired = report.expired,
            closed = report.closed,
            refreshed = report.refreshed,
            delivered = report.delivered,
            shed = report.shed,
            "broadcast sweep complete"
        );
        report
    }

    fn close_all(&self) {
        let mut closed = 0;
        self.sessions.range(&mut |session| {
            if let Some(client) = session.client() {
                if client.close() {
                    closed += 1;
                }
            }
            true
        });
        if closed > 0 {
            info!(closed, "closed remaining clients");
        }
    }
}

impl HubHandle {
    /// Register a connection and wait for the session token it was bound to.
    pub async fn register(
        &self,
        client: Arc<Client>,
        requested: Option<SessionToken>,
    ) -> CarrotResult<SessionToken> {
        let (reply, response) = oneshot::channel();
        self.register_tx
            .send(Registration {
                client,
                requested,
                reply,
            })
            .await
            .map_err(|_| CarrotError::HubClosed)?;
        response.await.map_err(|_| CarrotError::HubClosed)?
    }

    /// Ask the hub to close a connection's outbound queues.
    pub async fn unregister(&self, client: Arc<Client>) -> CarrotResult<()> {
        self.unregister_tx
            .send(client)
            .await
            .map_err(|_| CarrotError::HubClosed)
    }

    /// Submit a message for fan-out to every live session. Waits while the
    /// broadcast ingress is full.
    pub async fn broadcast(&self, message: impl Into<Arc<str>>) -> CarrotResult<()> {
        self.broadcast_tx
            .send(message.into())
            .await
            .map_err(|_| CarrotError::HubClosed)
    }

    pub fn session_exists(&self, token: &SessionToken) -> bool {
        self.sessions.exists(token)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.broadcast_tx.is_closed()
    }
}
