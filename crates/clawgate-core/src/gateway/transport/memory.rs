//! In-process transport.
//!
//! [`MemoryConnector`] hands every opened link to a [`MemoryGateway`], which
//! plays the server side: it can push frames, read what the client wrote,
//! and fail or close the connection. Used by the test suites and by
//! collaborators that want to drive the client without a socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, TransportEvent, TransportLink};
use crate::error::GatewayError;
use crate::gateway::protocol::{Envelope, RawFrame, decode, encode};

/// Client-side half: implements [`Connector`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    opened: Arc<AtomicUsize>,
    refuse_with: Arc<Mutex<Option<String>>>,
}

/// Server-side half: receives one [`MemoryPeer`] per opened link.
#[derive(Debug)]
pub struct MemoryGateway {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    opened: Arc<AtomicUsize>,
    refuse_with: Arc<Mutex<Option<String>>>,
}

impl MemoryConnector {
    /// A connector and the gateway end that sees its links.
    pub fn pair() -> (Self, MemoryGateway) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicUsize::new(0));
        let refuse_with = Arc::new(Mutex::new(None));
        (
            Self {
                accept_tx,
                opened: Arc::clone(&opened),
                refuse_with: Arc::clone(&refuse_with),
            },
            MemoryGateway {
                accept_rx,
                opened,
                refuse_with,
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str, origin: &str) -> Result<TransportLink, GatewayError> {
        let _ = self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.refuse_with.lock().take() {
            return Err(GatewayError::Transport(reason));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            origin: origin.to_string(),
            events: ev_tx,
            written: out_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| GatewayError::Transport("memory gateway is gone".into()))?;
        Ok(TransportLink::new(out_tx, ev_rx))
    }
}

impl MemoryGateway {
    /// Wait for the client to open its next link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Number of links the connector has been asked to open so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Make the next `open` fail with a transport error.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        *self.refuse_with.lock() = Some(reason.into());
    }
}

/// The gateway's view of one open link.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    origin: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    written: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The origin the client presented when opening the link.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Deliver a raw frame to the client.
    pub fn push(&self, frame: RawFrame) {
        let _ = self.events.send(TransportEvent::Message(frame));
    }

    /// Deliver an envelope to the client as a text frame.
    pub fn push_envelope(&self, envelope: &Envelope) {
        if let Ok(text) = encode(envelope) {
            self.push(RawFrame::Text(text));
        }
    }

    /// Report a transport error to the client.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error(reason.into()));
    }

    /// Close the link from the gateway side.
    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    /// Next envelope the client wrote. Undecodable writes are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let text = self.written.recv().await?;
            if let Ok(envelope) = decode(&RawFrame::Text(text)) {
                return Some(envelope);
            }
        }
    }

    /// An envelope the client already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(text) = self.written.try_recv() {
            if let Ok(envelope) = decode(&RawFrame::Text(text)) {
                return Some(envelope);
            }
        }
        None
    }

    /// Whether the client has dropped its end of the link.
    pub fn is_client_gone(&self) -> bool {
        self.events.is_closed()
    }
}
