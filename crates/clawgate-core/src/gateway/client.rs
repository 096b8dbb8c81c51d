//! Connection lifecycle manager and the public client surface.
//!
//! ```text
//!            connect()                 challenge                 res ok
//!   Idle ─────────────▶ Connecting ─────────────▶ AwaitingChallenge ─────────▶ Open
//!    ▲                      │                          │                        │
//!    │                      │ error / timeout          │ res !ok / error        │ close
//!    │                      ▼                          ▼                        │
//!    │      connect()     Closed ◀─────────────────────┘                        │
//!    └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection attempt gets an epoch. One spawned task per attempt owns
//! the [`TransportLink`](super::transport::TransportLink) and processes its
//! events strictly in arrival order; anything it does to shared state is
//! checked against its epoch first, so a stale task can never disturb a newer
//! connection.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::correlator::{PendingRequests, Settled};
use super::dispatcher::{Subscription, SubscriptionRegistry};
use super::protocol::{CONNECT_METHOD, Envelope, RawFrame, decode};
use super::sender::OutboundSender;
use super::transport::{Connector, TransportEvent, WebSocketConnector};
use crate::config::ClientConfig;
use crate::error::GatewayError;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingChallengeResponse,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingChallengeResponse => "awaiting-challenge-response",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

type ConnectResult = Result<(), GatewayError>;
type ConnectOutcome = Shared<BoxFuture<'static, ConnectResult>>;

/// One in-flight connection attempt. Every concurrent `connect()` caller
/// awaits a clone of the same `outcome`.
struct Attempt {
    epoch: u64,
    outcome: ConnectOutcome,
    resolve: oneshot::Sender<ConnectResult>,
    shutdown: CancellationToken,
}

impl Attempt {
    fn new(epoch: u64) -> Self {
        let (resolve, rx) = oneshot::channel();
        let outcome = rx
            .map(|settled| settled.unwrap_or(Err(GatewayError::ConnectionClosed)))
            .boxed()
            .shared();
        Self {
            epoch,
            outcome,
            resolve,
            shutdown: CancellationToken::new(),
        }
    }

    fn settle(self, result: ConnectResult) {
        let _ = self.resolve.send(result);
    }
}

enum Lifecycle {
    Idle,
    Connecting(Attempt),
    AwaitingChallengeResponse { attempt: Attempt, handshake_id: String },
    Open {
        epoch: u64,
        shutdown: CancellationToken,
        hello: Value,
    },
    Closed,
}

impl Lifecycle {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Idle,
            Self::Connecting(_) => ConnectionState::Connecting,
            Self::AwaitingChallengeResponse { .. } => ConnectionState::AwaitingChallengeResponse,
            Self::Open { .. } => ConnectionState::Open,
            Self::Closed => ConnectionState::Closed,
        }
    }

    /// Epoch of the connection this state belongs to, if any.
    fn epoch(&self) -> Option<u64> {
        match self {
            Self::Connecting(attempt) | Self::AwaitingChallengeResponse { attempt, .. } => {
                Some(attempt.epoch)
            }
            Self::Open { epoch, .. } => Some(*epoch),
            Self::Idle | Self::Closed => None,
        }
    }

    /// Outcome of the attempt in flight, if one is.
    fn in_flight(&self) -> Option<ConnectOutcome> {
        match self {
            Self::Connecting(attempt) | Self::AwaitingChallengeResponse { attempt, .. } => {
                Some(attempt.outcome.clone())
            }
            _ => None,
        }
    }

    fn is_attempt(&self, epoch: u64) -> bool {
        matches!(
            self,
            Self::Connecting(attempt) | Self::AwaitingChallengeResponse { attempt, .. }
                if attempt.epoch == epoch
        )
    }

    /// Stop the connection task and reject an unfinished attempt with `err`.
    fn teardown(self, err: GatewayError) {
        match self {
            Self::Connecting(attempt) | Self::AwaitingChallengeResponse { attempt, .. } => {
                attempt.shutdown.cancel();
                attempt.settle(Err(err));
            }
            Self::Open { shutdown, .. } => shutdown.cancel(),
            Self::Idle | Self::Closed => {}
        }
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    next_epoch: AtomicU64,
    pending: PendingRequests,
    subscriptions: SubscriptionRegistry,
    sender: OutboundSender,
    state_tx: watch::Sender<ConnectionState>,
}

/// Client for one OpenClaw gateway.
///
/// Construct it once at startup, share clones with whoever needs to talk to
/// the gateway, and call [`close`](Self::close) at shutdown. Cloning is cheap;
/// all clones drive the same connection.
///
/// The client never reconnects on its own. Watch
/// [`state_changes`](Self::state_changes) and call [`connect`](Self::connect)
/// again after the connection drops (see [`crate::retry::RetryPolicy`]).
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl GatewayClient {
    /// A client that reaches the gateway over WebSocket.
    pub fn new(config: ClientConfig) -> Result<Self, GatewayError> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// A client that opens its links through `connector`.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                lifecycle: Mutex::new(Lifecycle::Idle),
                next_epoch: AtomicU64::new(1),
                pending: PendingRequests::new(),
                subscriptions: SubscriptionRegistry::new(),
                sender: OutboundSender::new(),
                state_tx,
            }),
        })
    }

    /// Connect and complete the handshake.
    ///
    /// Returns at once if already open. Callers that overlap an attempt in
    /// flight share its outcome; only one link is opened and one handshake
    /// sent.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let outcome = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Open { .. }) {
                return Ok(());
            }
            match lifecycle.in_flight() {
                Some(outcome) => outcome,
                None => {
                    let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let attempt = Attempt::new(epoch);
                    let outcome = attempt.outcome.clone();
                    let shutdown = attempt.shutdown.clone();
                    *lifecycle = Lifecycle::Connecting(attempt);
                    self.inner.publish(ConnectionState::Connecting);
                    info!(url = %self.inner.config.url, epoch, "connecting to gateway");
                    tokio::spawn(Arc::clone(&self.inner).drive(epoch, shutdown));
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Send `method` with `params` and wait for the response body.
    ///
    /// Connects first if needed. Fails with [`GatewayError::Protocol`] when
    /// the gateway answers `ok: false`, and with [`GatewayError::Timeout`]
    /// when no answer arrives within the configured request timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.connect().await?;
        let (id, reply) = self.inner.pending.register(method);
        let envelope = Envelope::request(id.clone(), method, params);
        if let Err(err) = self.inner.sender.send(&envelope) {
            let _ = self.inner.pending.cancel(&id);
            return Err(err);
        }
        debug!(id = %id, method, "request sent");
        self.inner
            .pending
            .wait(&id, method, reply, self.inner.config.request_timeout())
            .await
    }

    /// [`request`](Self::request), deserializing the body into `R`.
    pub async fn request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<R, GatewayError> {
        let body = self.request(method, params).await?;
        serde_json::from_value(body).map_err(|e| GatewayError::UnexpectedBody {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Call `handler` with the payload of every `event` until the returned
    /// subscription is unsubscribed.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(event, handler)
    }

    /// Tear the connection down.
    ///
    /// An attempt in flight and every pending request are rejected with
    /// [`GatewayError::ConnectionClosed`]. The client is left `Idle` and may
    /// connect again.
    pub fn close(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        let previous = mem::replace(&mut *lifecycle, Lifecycle::Idle);
        if previous.state() != ConnectionState::Idle {
            info!(url = %self.inner.config.url, "closing gateway connection");
        }
        self.inner.sender.detach_all();
        previous.teardown(GatewayError::ConnectionClosed);
        let failed = self.inner.pending.fail_all(&GatewayError::ConnectionClosed);
        if failed > 0 {
            debug!(failed, "rejected pending requests on close");
        }
        self.inner.publish(ConnectionState::Idle);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state()
    }

    /// Open, with a writer that still reaches the transport.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open && self.inner.sender.is_ready()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Body of the accepted handshake response, while open.
    pub fn hello(&self) -> Option<Value> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Open { hello, .. } => Some(hello.clone()),
            _ => None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    fn publish(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }

    /// Connection task for attempt `epoch`.
    async fn drive(self: Arc<Self>, epoch: u64, shutdown: CancellationToken) {
        let handshake_timeout = self.config.request_timeout();
        let handshake_deadline = tokio::time::sleep(handshake_timeout.unwrap_or_default());
        tokio::pin!(handshake_deadline);
        let timed_out = || GatewayError::Timeout {
            method: CONNECT_METHOD.to_string(),
            after: handshake_timeout.unwrap_or_default(),
        };

        let opened = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = &mut handshake_deadline, if handshake_timeout.is_some() => {
                self.fail_attempt(epoch, timed_out());
                return;
            }
            opened = self.connector.open(&self.config.url, &self.config.origin) => opened,
        };
        let mut link = match opened {
            Ok(link) => link,
            Err(err) => {
                warn!(url = %self.config.url, error = %err, "failed to open gateway connection");
                self.fail_attempt(epoch, err);
                return;
            }
        };
        info!(url = %self.config.url, epoch, "transport open, waiting for challenge");
        self.sender.attach(epoch, link.writer());

        loop {
            let handshaking = self.lifecycle.lock().is_attempt(epoch);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = &mut handshake_deadline, if handshaking && handshake_timeout.is_some() => {
                    warn!(url = %self.config.url, "gateway handshake timed out");
                    self.fail_attempt(epoch, timed_out());
                    break;
                }
                event = link.next_event() => match event {
                    Some(TransportEvent::Message(frame)) => {
                        if !self.handle_frame(epoch, &frame) {
                            break;
                        }
                    }
                    Some(TransportEvent::Error(reason)) => {
                        warn!(url = %self.config.url, error = %reason, "transport error");
                        if self.fail_attempt(epoch, GatewayError::Transport(reason)) {
                            break;
                        }
                    }
                    Some(TransportEvent::Closed) | None => break,
                },
            }
        }
        self.on_closed(epoch);
    }

    /// Returns whether the connection task should keep running.
    fn handle_frame(&self, epoch: u64, frame: &RawFrame) -> bool {
        let envelope = match decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, len = frame.len(), "discarding undecodable frame");
                return true;
            }
        };
        match envelope {
            Envelope::Event(event) if event.is_connect_challenge() => self.on_challenge(epoch),
            Envelope::Event(event) => {
                let delivered = self.subscriptions.dispatch(&event.event, &event.payload);
                trace!(event = %event.event, delivered, "event dispatched");
                true
            }
            Envelope::Response(response) => {
                let id = response.id.clone();
                match self.pending.settle(response) {
                    Settled::Handshake(reply) => self.on_handshake_reply(epoch, reply),
                    Settled::Caller => true,
                    Settled::Unmatched => {
                        debug!(id = %id, "dropping response with no pending request");
                        true
                    }
                }
            }
            Envelope::Request(request) => {
                debug!(method = %request.method, "ignoring gateway-initiated request");
                true
            }
        }
    }

    fn on_challenge(&self, epoch: u64) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let attempt = match mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Connecting(attempt) if attempt.epoch == epoch => attempt,
            other => {
                warn!(state = %other.state(), "ignoring connect.challenge, handshake already sent");
                *lifecycle = other;
                return true;
            }
        };

        let handshake_id = self.pending.register_handshake(CONNECT_METHOD);
        let sent = serde_json::to_value(self.config.connect_params())
            .map_err(|e| GatewayError::Serialize(e.to_string()))
            .and_then(|params| {
                self.sender.send(&Envelope::request(
                    handshake_id.clone(),
                    CONNECT_METHOD,
                    params,
                ))
            });
        if let Err(err) = sent {
            let _ = self.pending.cancel(&handshake_id);
            self.publish(ConnectionState::Closed);
            attempt.settle(Err(err));
            return false;
        }

        debug!(id = %handshake_id, role = %self.config.role, "handshake sent");
        *lifecycle = Lifecycle::AwaitingChallengeResponse {
            attempt,
            handshake_id,
        };
        self.publish(ConnectionState::AwaitingChallengeResponse);
        true
    }

    fn on_handshake_reply(&self, epoch: u64, reply: Result<Value, GatewayError>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let attempt = match mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::AwaitingChallengeResponse { attempt, .. } if attempt.epoch == epoch => {
                attempt
            }
            other => {
                debug!("dropping handshake reply for a superseded attempt");
                *lifecycle = other;
                return true;
            }
        };

        match reply {
            Ok(hello) => {
                *lifecycle = Lifecycle::Open {
                    epoch,
                    shutdown: attempt.shutdown.clone(),
                    hello,
                };
                self.publish(ConnectionState::Open);
                info!(url = %self.config.url, "gateway handshake accepted");
                attempt.settle(Ok(()));
                true
            }
            Err(err) => {
                self.publish(ConnectionState::Closed);
                warn!(url = %self.config.url, error = %err, "gateway rejected handshake");
                attempt.settle(Err(err));
                false
            }
        }
    }

    /// Reject attempt `epoch` with `err` and move to `Closed`. Returns
    /// `false` when the attempt already finished (the connection is open or
    /// superseded).
    fn fail_attempt(&self, epoch: u64, err: GatewayError) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.is_attempt(epoch) {
            return false;
        }
        let previous = mem::replace(&mut *lifecycle, Lifecycle::Closed);
        if let Lifecycle::AwaitingChallengeResponse { handshake_id, .. } = &previous {
            let _ = self.pending.cancel(handshake_id);
        }
        self.publish(ConnectionState::Closed);
        previous.teardown(err);
        true
    }

    /// The link of connection `epoch` is gone.
    fn on_closed(&self, epoch: u64) {
        self.sender.detach(epoch);
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.epoch() != Some(epoch) {
            return;
        }
        let previous = mem::replace(&mut *lifecycle, Lifecycle::Idle);
        info!(url = %self.config.url, was = %previous.state(), "gateway connection closed");
        previous.teardown(GatewayError::ConnectionClosed);
        let failed = self.pending.fail_all(&GatewayError::ConnectionClosed);
        if failed > 0 {
            debug!(failed, "rejected pending requests after close");
        }
        self.publish(ConnectionState::Idle);
    }
}
