use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::{Envelope, OutgoingMessage, decode_incoming, encode_outgoing};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{RelayError, SignalSink};

const USER_QUERY_KEY: &str = "userID";

/// Websocket connection to the signaling relay.
///
/// Outgoing messages are encoded and queued to a writer task; a reader task decodes
/// every text or binary frame and forwards the envelope. Dropping the client aborts
/// both tasks.
pub struct RelayClient {
    user_id: String,
    send_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayClient {
    pub async fn connect(
        relay_url: &str,
        user_id: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>), RelayError> {
        let websocket_url = derive_websocket_url(relay_url, user_id)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| RelayError::Connect(err.to_string()))?;
        tracing::debug!(
            target: "parley::relay",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer_handle = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                let message = match String::from_utf8(frame) {
                    Ok(text) => Message::Text(text),
                    Err(err) => Message::Binary(err.into_bytes()),
                };
                if let Err(err) = ws_write.send(message).await {
                    tracing::warn!(target: "parley::relay", error = %err, "relay write failed");
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(
                            target: "parley::relay",
                            event = "ws_in",
                            kind = "text",
                            len = text.len()
                        );
                        text.into_bytes()
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::trace!(
                            target: "parley::relay",
                            event = "ws_in",
                            kind = "binary",
                            len = data.len()
                        );
                        data
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "parley::relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "parley::relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match decode_incoming(&frame) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "parley::relay",
                            error = %err,
                            len = frame.len(),
                            "dropping undecodable relay frame"
                        );
                    }
                }
            }
        });

        let client = Arc::new(Self {
            user_id: user_id.to_string(),
            send_tx,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        });
        Ok((client, inbound_rx))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl SignalSink for RelayClient {
    async fn send(&self, room: &str, message: OutgoingMessage) -> Result<(), RelayError> {
        let frame = encode_outgoing(Some(room), &message)?;
        tracing::trace!(
            target: "parley::relay",
            event = "ws_out",
            kind = %message.message_type(),
            len = frame.len()
        );
        self.send_tx.send(frame).map_err(|_| RelayError::Closed)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Normalizes http(s) to ws(s) and attaches the user id query parameter.
fn derive_websocket_url(relay_url: &str, user_id: &str) -> Result<Url, RelayError> {
    let invalid = |reason: String| RelayError::InvalidUrl {
        url: relay_url.to_string(),
        reason,
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".to_string()))?;
    let has_user = url.query_pairs().any(|(key, _)| key == USER_QUERY_KEY);
    if !has_user {
        url.query_pairs_mut().append_pair(USER_QUERY_KEY, user_id);
    }
    url.set_fragment(None);
    Ok(url)
}
