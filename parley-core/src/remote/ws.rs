//! Websocket transport for the live session protocol.
//!
//! One writer task serializes [`OutboundMessage`]s into `realtimeInput`
//! frames; one reader task maps server frames into [`InboundMessage`]s.
//! A remote close frame becomes `Closed`, a transport error becomes `Error`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    protocol::{parse_server_message, ClientMessage},
    InboundMessage, OutboundMessage, RemoteConnector, RemoteHandle, RemoteLink, SessionSetup,
};
use crate::error::{ParleyError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const INBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct WsConnector {
    endpoint: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint, self.api_key)
        }
    }
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl RemoteConnector for WsConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        mut outbound: mpsc::Receiver<OutboundMessage>,
    ) -> Result<RemoteLink> {
        let (socket, _response) = connect_async(self.url())
            .await
            .map_err(|e| ParleyError::RemoteSession(format!("connect failed: {e}")))?;
        info!(endpoint = %self.endpoint, model = %setup.model, "websocket connected");

        let (mut sink, mut stream) = socket.split();
        sink.send(Message::Text(ClientMessage::setup(setup).encode()?))
            .await
            .map_err(|e| ParleyError::RemoteSession(format!("setup send failed: {e}")))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    message = outbound.recv() => {
                        let Some(message) = message else { break };
                        let text = match ClientMessage::from(message).encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode outbound frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(error = %e, "websocket send failed");
                            break;
                        }
                    }
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "websocket close failed");
            }
            debug!("websocket writer stopped");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.into_owned())
                            .filter(|r| !r.is_empty());
                        let _ = inbound_tx.send(InboundMessage::Closed { reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx
                            .send(InboundMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };

                match parse_server_message(&text) {
                    Ok(messages) => {
                        for message in messages {
                            if inbound_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unparseable server frame"),
                }
            }
            let _ = inbound_tx.send(InboundMessage::Closed { reason: None }).await;
        });

        Ok(RemoteLink {
            inbound: inbound_rx,
            handle: Box::new(WsHandle {
                shutdown: shutdown_tx,
                reader: Some(reader),
                _writer: writer,
            }),
        })
    }
}

struct WsHandle {
    shutdown: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    _writer: JoinHandle<()>,
}

impl RemoteHandle for WsHandle {
    fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(reader) = self.reader.take() {
            reader.abort();
            debug!("websocket reader aborted");
        }
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        self.close();
    }
}
