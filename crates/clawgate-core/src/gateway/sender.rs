//! Outbound writes.
//!
//! There is no outbound queue: an envelope is written only while a
//! connection's writer is attached and still open, otherwise the send fails
//! with [`GatewayError::NotReady`].

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::protocol::{Envelope, encode};
use crate::error::GatewayError;

#[derive(Debug)]
struct Writer {
    epoch: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Serializes envelopes and hands them to the current connection.
#[derive(Debug, Default)]
pub struct OutboundSender {
    writer: Mutex<Option<Writer>>,
}

impl OutboundSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sends to the writer of connection `epoch`.
    pub fn attach(&self, epoch: u64, tx: mpsc::UnboundedSender<String>) {
        *self.writer.lock() = Some(Writer { epoch, tx });
    }

    /// Stop routing to connection `epoch`. A newer connection's writer is
    /// left in place.
    pub fn detach(&self, epoch: u64) {
        let mut writer = self.writer.lock();
        if writer.as_ref().is_some_and(|w| w.epoch == epoch) {
            *writer = None;
        }
    }

    /// Stop routing to any connection.
    pub fn detach_all(&self) {
        *self.writer.lock() = None;
    }

    /// Whether a write would currently reach an open transport.
    pub fn is_ready(&self) -> bool {
        self.writer
            .lock()
            .as_ref()
            .is_some_and(|w| !w.tx.is_closed())
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let text = encode(envelope)?;
        let writer = self.writer.lock();
        let Some(writer) = writer.as_ref().filter(|w| !w.tx.is_closed()) else {
            warn!(kind = envelope.kind(), "Cannot send, socket not open");
            return Err(GatewayError::NotReady);
        };
        writer.tx.send(text).map_err(|_| {
            warn!(kind = envelope.kind(), "Cannot send, socket closed during write");
            GatewayError::NotReady
        })?;
        trace!(kind = envelope.kind(), epoch = writer.epoch, "envelope written");
        Ok(())
    }
}
