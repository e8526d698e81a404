//! Connection handling: per-client outbound queues plus the read and write pumps
//!
//! A connection is registered with the hub first; only once the hub has
//! acknowledged (and, for a fresh session, queued the minted token) are the
//! two pumps started. The read pump feeds the middleware pipeline, the write
//! pump drains the outbound queues onto the transport and sends keepalive
//! pings.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::{CarrotError, CarrotResult};
use crate::frame::{Batch, Frame, normalize_inbound};
use crate::hub::HubHandle;
use crate::pipeline::Request;
use crate::session::SessionToken;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outcome of a non-blocking hand-off to a client's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Full,
    Closed,
}

struct Outbound {
    messages: mpsc::Sender<Arc<str>>,
    tokens: mpsc::Sender<SessionToken>,
}

impl Outbound {
    fn depth(&self) -> usize {
        self.messages.max_capacity() - self.messages.capacity()
    }
}

/// Fill level of an outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    /// Above the high-water mark
    High,
    Full,
}

/// Receiving ends of a client's outbound queues, owned by its write pump.
pub struct ClientQueues {
    pub messages: mpsc::Receiver<Arc<str>>,
    pub tokens: mpsc::Receiver<SessionToken>,
}

/// Shared state of one connection.
///
/// The hub holds only weak references (through the session it is bound to);
/// the connection's pumps hold the strong ones.
pub struct Client {
    id: u64,
    open: AtomicBool,
    outbound: Mutex<Option<Outbound>>,
    session: RwLock<Option<SessionToken>>,
    shutdown: CancellationToken,
    capacity: usize,
    warning_threshold: usize,
}

impl Client {
    pub fn new(id: u64, config: &HubConfig) -> (Arc<Self>, ClientQueues) {
        let capacity = config.send_buffer.max(1);
        let (messages_tx, messages_rx) = mpsc::channel(capacity);
        let (tokens_tx, tokens_rx) = mpsc::channel(config.token_buffer.max(1));

        let client = Arc::new(Self {
            id,
            open: AtomicBool::new(false),
            outbound: Mutex::new(Some(Outbound {
                messages: messages_tx,
                tokens: tokens_tx,
            })),
            session: RwLock::new(None),
            shutdown: CancellationToken::new(),
            capacity,
            warning_threshold: config.warning_threshold(),
        });
        let queues = ClientQueues {
            messages: messages_rx,
            tokens: tokens_rx,
        };
        (client, queues)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Close both outbound queues. Only the first call after the client was
    /// opened has an effect; returns whether this call closed them.
    pub(crate) fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let dropped = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        dropped.is_some()
    }

    /// Token of the session this client is bound to
    pub fn session(&self) -> Option<SessionToken> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_session(&self, token: SessionToken) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }

    /// Messages currently waiting in the outbound queue
    pub fn queued(&self) -> usize {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outbound.as_ref().map_or(0, Outbound::depth)
    }

    /// Resolves once either pump has terminated the connection
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Tear the transport down; both pumps observe this.
    pub fn terminate(&self) {
        self.shutdown.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Hand a message to the outbound queue without waiting.
    pub(crate) fn try_deliver(&self, message: Arc<str>) -> Delivery {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(out) = outbound.as_ref() else {
            return Delivery::Closed;
        };
        match out.messages.try_send(message) {
            Ok(()) => {
                self.log_backpressure(out.depth());
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a session token for the write pump. Returns `false` if the
    /// token queue is full or closed.
    pub(crate) fn send_token(&self, token: SessionToken) -> bool {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outbound.as_ref() {
            Some(out) => out.tokens.try_send(token).is_ok(),
            None => false,
        }
    }

    /// Classify a queue length against capacity and the high-water mark
    pub fn pressure(&self, queued: usize) -> Pressure {
        if queued >= self.capacity {
            Pressure::Full
        } else if queued > self.warning_threshold {
            Pressure::High
        } else {
            Pressure::Normal
        }
    }

    fn log_backpressure(&self, queued: usize) {
        match self.pressure(queued) {
            Pressure::Full => error!(
                client_id = self.id,
                open = self.is_open(),
                size = queued,
                channel = "send",
                "outbound queue is full"
            ),
            Pressure::High => warn!(
                client_id = self.id,
                open = self.is_open(),
                size = queued,
                channel = "send",
                "outbound queue above high-water mark"
            ),
            Pressure::Normal => {}
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("session", &self.session())
            .finish()
    }
}

/// Register a freshly accepted transport with the hub and run its pumps
/// until the connection ends.
///
/// `requested` is the token the peer presented, if any. Returns the session
/// token the connection was bound to.
pub async fn serve<S, R, E>(
    mut sink: S,
    stream: R,
    requested: Option<SessionToken>,
    hub: HubHandle,
    ingress: mpsc::Sender<Request>,
    config: Arc<HubConfig>,
) -> CarrotResult<SessionToken>
where
    S: Sink<Frame> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (client, queues) = Client::new(next_client_id(), &config);

    let token = match hub.register(client.clone(), requested).await {
        Ok(token) => token,
        Err(e) => {
            warn!(client_id = client.id(), error = %e, "registration rejected");
            let _ = write_frame(&mut sink, Frame::Close, config.write_wait()).await;
            let _ = timeout(config.write_wait(), sink.close()).await;
            return Err(e);
        }
    };
    info!(client_id = client.id(), session_token = %token, "client joined");

    let writer = tokio::spawn(write_pump(client.clone(), queues, sink, config.clone()));
    let reader = tokio::spawn(read_pump(client.clone(), stream, hub, ingress, config));

    let (write_done, read_done) = tokio::join!(writer, reader);
    if let Err(e) = write_done {
        error!(client_id = client.id(), error = %e, "write pump panicked");
    }
    if let Err(e) = read_done {
        error!(client_id = client.id(), error = %e, "read pump panicked");
    }
    info!(client_id = client.id(), session_token = %token, "client left");
    Ok(token)
}

/// Pump inbound frames into the pipeline ingress. Always unregisters the
/// client and tears the transport down on the way out.
pub async fn read_pump<R, E>(
    client: Arc<Client>,
    mut stream: R,
    hub: HubHandle,
    ingress: mpsc::Sender<Request>,
    config: Arc<HubConfig>,
) where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    match read_loop(&client, &mut stream, &ingress, &config).await {
        Ok(()) => debug!(client_id = client.id(), "read pump finished"),
        Err(e) => debug!(client_id = client.id(), error = %e, "read pump stopped"),
    }

    if let Err(e) = hub.unregister(client.clone()).await {
        debug!(client_id = client.id(), error = %e, "unregister skipped");
    }
    client.terminate();
}

async fn read_loop<R, E>(
    client: &Client,
    stream: &mut R,
    ingress: &mpsc::Sender<Request>,
    config: &HubConfig,
) -> CarrotResult<()>
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let pong_wait = config.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = client.closed() => return Ok(()),
            next = timeout_at(deadline, stream.next()) => match next {
                Err(_) => {
                    return Err(CarrotError::ConnectionClosed("read deadline exceeded".into()));
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(CarrotError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            },
        };

        match frame {
            Frame::Pong(_) => deadline = Instant::now() + pong_wait,
            Frame::Ping(_) => {}
            Frame::Close => return Ok(()),
            Frame::Text(text) => {
                if text.len() > config.max_message_size {
                    return Err(CarrotError::Transport(format!(
                        "frame of {} bytes exceeds limit of {}",
                        text.len(),
                        config.max_message_size
                    )));
                }
                let Some(session) = client.session() else {
                    continue;
                };
                let request = Request::new(session, normalize_inbound(&text));
                debug!(session_token = %request.session, "request being sent to middleware");

                tokio::select! {
                    _ = client.closed() => return Ok(()),
                    sent = ingress.send(request) => {
                        if sent.is_err() {
                            return Err(CarrotError::ConnectionClosed("pipeline stopped".into()));
                        }
                    }
                }
            }
        }
    }
}

/// Drain the outbound queues onto the transport and keep the peer alive
/// with periodic pings.
pub async fn write_pump<S>(client: Arc<Client>, mut queues: ClientQueues, mut sink: S, config: Arc<HubConfig>)
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match write_loop(&client, &mut queues, &mut sink, &config).await {
        Ok(()) => debug!(client_id = client.id(), "write pump finished"),
        Err(e) => debug!(client_id = client.id(), error = %e, "write pump stopped"),
    }

    client.terminate();
    let _ = timeout(config.write_wait(), sink.close()).await;
}

async fn write_loop<S>(
    client: &Client,
    queues: &mut ClientQueues,
    sink: &mut S,
    config: &HubConfig,
) -> CarrotResult<()>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let wait = config.write_wait();
    let period = config.ping_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            // Tokens first: a freshly minted token must reach the peer
            // before any data frame.
            biased;

            token = queues.tokens.recv() => match token {
                Some(token) => {
                    let mut batch = Batch::new(token.as_str());
                    while let Ok(next) = queues.tokens.try_recv() {
                        batch.push(next.as_str());
                    }
                    write_frame(sink, batch.into_frame(), wait).await?;
                }
                None => {
                    debug!(client_id = client.id(), "token queue closed");
                    let _ = write_frame(sink, Frame::Close, wait).await;
                    return Ok(());
                }
            },

            message = queues.messages.recv() => match message {
                Some(message) => {
                    let mut batch = Batch::new(&message);
                    while let Ok(next) = queues.messages.try_recv() {
                        batch.push(&next);
                    }
                    if batch.count() > 1 {
                        debug!(client_id = client.id(), count = batch.count(), "coalesced outbound messages");
                    }
                    write_frame(sink, batch.into_frame(), wait).await?;
                }
                None => {
                    debug!(client_id = client.id(), "message queue closed");
                    let _ = write_frame(sink, Frame::Close, wait).await;
                    return Ok(());
                }
            },

            _ = ticker.tick() => write_frame(sink, Frame::Ping(Vec::new()), wait).await?,

            _ = client.closed() => return Ok(()),
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: Frame, wait: Duration) -> CarrotResult<()>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match timeout(wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CarrotError::Transport(e.to_string())),
        Err(_) => Err(CarrotError::ConnectionClosed("write deadline exceeded".into())),
    }
}
