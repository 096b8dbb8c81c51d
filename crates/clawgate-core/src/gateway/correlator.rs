//! Request correlation.
//!
//! Each outbound request gets a fresh correlation id and a pending entry.
//! The first matching response removes the entry and settles it; later
//! responses with the same id find nothing and are dropped. Timeouts and
//! connection loss remove entries through the same map, so an entry is
//! settled exactly once whichever path gets there first.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::ResponseFrame;
use crate::error::GatewayError;

/// What a caller eventually receives for one request.
pub type Reply = Result<Value, GatewayError>;

/// Who is waiting on a pending id.
#[derive(Debug)]
enum Continuation {
    /// An ordinary `request()` caller.
    Caller(oneshot::Sender<Reply>),
    /// The connection's own handshake; settled by the lifecycle manager.
    Handshake,
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    continuation: Continuation,
}

/// Result of matching a response against the pending set.
#[derive(Debug, PartialEq)]
pub enum Settled {
    /// A caller's request was settled.
    Caller,
    /// The handshake was answered; the lifecycle manager acts on the reply.
    Handshake(Reply),
    /// No pending entry had this id.
    Unmatched,
}

/// The set of requests awaiting a response.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for `method` and register a caller waiting on it.
    pub fn register(&self, method: &str) -> (String, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(method, Continuation::Caller(tx));
        (id, rx)
    }

    /// Allocate an id for the handshake request.
    pub fn register_handshake(&self, method: &str) -> String {
        self.insert(method, Continuation::Handshake)
    }

    fn insert(&self, method: &str, continuation: Continuation) -> String {
        let mut entries = self.entries.lock();
        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let _ = entries.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                continuation,
            },
        );
        id
    }

    /// Settle the entry matching `response.id`, if any.
    pub fn settle(&self, response: ResponseFrame) -> Settled {
        let mut entries = self.entries.lock();
        let Some(pending) = entries.remove(&response.id) else {
            return Settled::Unmatched;
        };
        let id = response.id.clone();
        let reply = response.into_result();
        debug!(id = %id, method = %pending.method, ok = reply.is_ok(), "response matched");
        match pending.continuation {
            Continuation::Caller(tx) => {
                // Sent while the map is still locked, so a concurrent timeout
                // that finds the entry gone knows the reply is already queued.
                if tx.send(reply).is_err() {
                    debug!(id = %id, "caller went away before its response arrived");
                }
                Settled::Caller
            }
            Continuation::Handshake => Settled::Handshake(reply),
        }
    }

    /// Remove an entry without settling it. Returns whether it was present.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Reject every pending caller with `err` and empty the set.
    pub fn fail_all(&self, err: &GatewayError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            debug!(id = %id, method = %pending.method, error = %err, "failing pending request");
            if let Continuation::Caller(tx) = pending.continuation {
                let _ = tx.send(Err(err.clone()));
            }
        }
        count
    }

    /// Wait for the reply to `id`, giving up after `timeout` if one is set.
    pub async fn wait(
        &self,
        id: &str,
        method: &str,
        mut reply: oneshot::Receiver<Reply>,
        timeout: Option<Duration>,
    ) -> Reply {
        let received = match timeout {
            None => reply.await,
            Some(after) => match tokio::time::timeout(after, &mut reply).await {
                Ok(received) => received,
                Err(_) if self.cancel(id) => {
                    warn!(id, method, ?after, "request timed out");
                    return Err(GatewayError::Timeout {
                        method: method.to_string(),
                        after,
                    });
                }
                // Lost the race to a response: it is already in the channel.
                Err(_) => reply.await,
            },
        };
        received.unwrap_or(Err(GatewayError::ConnectionClosed))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }
}
