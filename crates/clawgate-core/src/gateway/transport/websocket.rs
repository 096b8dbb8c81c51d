//! WebSocket transport built on `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connector, TransportEvent, TransportLink};
use crate::error::GatewayError;
use crate::gateway::protocol::RawFrame;

/// Opens gateway connections over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str, origin: &str) -> Result<TransportLink, GatewayError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| GatewayError::Config(format!("invalid gateway url {url}: {e}")))?;
        let origin_value = HeaderValue::from_str(origin)
            .map_err(|e| GatewayError::Config(format!("invalid origin {origin:?}: {e}")))?;
        request.headers_mut().insert(ORIGIN, origin_value);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        info!(url, "WebSocket connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    next = out_rx.recv() => match next {
                        Some(text) => text,
                        None => break,
                    },
                };
                if let Err(err) = sink.send(Message::text(text)).await {
                    warn!(error = %err, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        let _ = ev_tx.send(TransportEvent::Message(RawFrame::Text(
                            text.as_str().to_owned(),
                        )));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = ev_tx.send(TransportEvent::Message(RawFrame::Block(data)));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close frame");
                        break;
                    }
                    // tungstenite answers pings on its own.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = ev_tx.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                    None => break,
                }
            }
            info!("WebSocket closed");
            let _ = ev_tx.send(TransportEvent::Closed);
            // Stop the writer too, so the sender side reports not-ready.
            reader_shutdown.cancel();
        });

        Ok(TransportLink::new(out_tx, ev_rx).with_shutdown(shutdown))
    }
}
