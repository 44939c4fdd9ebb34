//! Bulk transfers over the aux channel.
//!
//! A transfer is a JSON start frame, raw binary chunks, and a JSON end frame, sent to
//! every target in turn. Chunks carry no header, so each channel must deliver one
//! transfer's frames in order; [`BulkSender`] keeps outbound transfers from overlapping.

use std::sync::Arc;

use bytes::Bytes;
use parley_proto::{BulkControl, ProtocolError, encode_control, total_chunks};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::transport::{AuxChannel, TransportError};

pub mod receiver;

pub use receiver::{BulkReceiver, CompletedTransfer, CompletionReason, TransferProgress};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("peers not ready for bulk transfer: {peers:?}")]
    PeersNotReady { peers: Vec<String> },
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unsupported payload type {0}")]
    UnsupportedType(String),
    #[error("channel to {peer_id} failed: {source}")]
    Channel {
        peer_id: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPayload {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

/// One peer's open aux channel.
#[derive(Clone)]
pub struct BulkTarget {
    pub peer_id: String,
    pub channel: Arc<dyn AuxChannel>,
}

/// Checks that hold regardless of peer readiness.
pub fn validate(payload: &BulkPayload, config: &MeshConfig) -> Result<(), TransferError> {
    if payload.data.is_empty() {
        return Err(TransferError::EmptyPayload);
    }
    if payload.data.len() > config.max_bulk_bytes {
        return Err(TransferError::PayloadTooLarge {
            size: payload.data.len(),
            max: config.max_bulk_bytes,
        });
    }
    if !config.accepts_mime(&payload.mime) {
        return Err(TransferError::UnsupportedType(payload.mime.clone()));
    }
    Ok(())
}

/// Runs outbound transfers one at a time.
#[derive(Debug, Default)]
pub struct BulkSender {
    outbound: Mutex<()>,
}

impl BulkSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends one payload to every target once earlier transfers have finished.
    pub async fn send(
        &self,
        targets: &[BulkTarget],
        payload: &BulkPayload,
        config: &MeshConfig,
    ) -> Result<String, TransferError> {
        let _turn = self.outbound.lock().await;
        send_bulk(targets, payload, config).await
    }
}

/// Sends one payload to every target and returns the transfer id.
///
/// Nothing is written unless every target channel is open when the call starts.
async fn send_bulk(
    targets: &[BulkTarget],
    payload: &BulkPayload,
    config: &MeshConfig,
) -> Result<String, TransferError> {
    validate(payload, config)?;
    let not_ready: Vec<String> = targets
        .iter()
        .filter(|target| !target.channel.is_open())
        .map(|target| target.peer_id.clone())
        .collect();
    if targets.is_empty() || !not_ready.is_empty() {
        return Err(TransferError::PeersNotReady { peers: not_ready });
    }

    let id = Uuid::new_v4().to_string();
    let chunk_size = config.chunk_bytes.clamp(1, u32::MAX as usize);
    let size = payload.data.len() as u64;
    let chunk_count = total_chunks(size, chunk_size as u32);
    let start = encode_control(&BulkControl::Start {
        id: id.clone(),
        name: payload.name.clone(),
        mime: payload.mime.clone(),
        size,
        chunk_size: chunk_size as u32,
        total_chunks: chunk_count,
    })?;
    let end = encode_control(&BulkControl::End { id: id.clone() })?;

    for target in targets {
        send_text(target, start.clone()).await?;
    }
    for offset in (0..payload.data.len()).step_by(chunk_size) {
        let chunk = payload
            .data
            .slice(offset..(offset + chunk_size).min(payload.data.len()));
        for target in targets {
            wait_for_buffer_space(target, config).await;
            target
                .channel
                .send_binary(chunk.clone())
                .await
                .map_err(|source| TransferError::Channel {
                    peer_id: target.peer_id.clone(),
                    source,
                })?;
        }
    }
    for target in targets {
        send_text(target, end.clone()).await?;
    }

    info!(
        target: "parley::transfer",
        transfer_id = %id,
        size,
        chunks = chunk_count,
        peers = targets.len(),
        "bulk transfer sent"
    );
    Ok(id)
}

async fn send_text(target: &BulkTarget, text: String) -> Result<(), TransferError> {
    target
        .channel
        .send_text(text)
        .await
        .map_err(|source| TransferError::Channel {
            peer_id: target.peer_id.clone(),
            source,
        })
}

/// Waits for buffered-amount-low while the channel is over the high-water mark. Gives
/// up after the configured timeout and lets the send proceed.
async fn wait_for_buffer_space(target: &BulkTarget, config: &MeshConfig) {
    let buffered = target.channel.buffered_amount().await;
    if buffered <= config.buffered_high_water {
        return;
    }
    debug!(
        target: "parley::transfer",
        peer_id = %target.peer_id,
        buffered,
        "waiting for channel to drain"
    );
    if tokio::time::timeout(
        config.backpressure_timeout,
        target.channel.buffered_amount_low(),
    )
    .await
    .is_err()
    {
        warn!(
            target: "parley::transfer",
            peer_id = %target.peer_id,
            buffered,
            "backpressure wait timed out; sending anyway"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockChannel;
    use crate::transport::{AUX_CHANNEL_LABEL, ChannelMessage};
    use std::time::Duration;

    fn config() -> MeshConfig {
        MeshConfig {
            chunk_bytes: 4,
            buffered_high_water: 1_000,
            buffered_low_water: 100,
            backpressure_timeout: Duration::from_secs(2),
            ..MeshConfig::default()
        }
    }

    fn image(data: &'static [u8]) -> BulkPayload {
        BulkPayload {
            name: "cat.png".into(),
            mime: "image/png".into(),
            data: Bytes::from_static(data),
        }
    }

    fn target(peer_id: &str, channel: &Arc<MockChannel>) -> BulkTarget {
        BulkTarget {
            peer_id: peer_id.into(),
            channel: channel.clone(),
        }
    }

    #[test]
    fn validation_rejects_before_readiness() {
        let config = config();
        assert_eq!(validate(&image(b""), &config), Err(TransferError::EmptyPayload));
        let text = BulkPayload {
            mime: "text/plain".into(),
            ..image(b"hello")
        };
        assert_eq!(
            validate(&text, &config),
            Err(TransferError::UnsupportedType("text/plain".into()))
        );
        let small = MeshConfig {
            max_bulk_bytes: 3,
            ..config.clone()
        };
        assert!(matches!(
            validate(&image(b"hello"), &small),
            Err(TransferError::PayloadTooLarge { size: 5, max: 3 })
        ));
        let open = MeshConfig {
            bulk_mime_prefixes: Vec::new(),
            ..config
        };
        assert!(validate(&text, &open).is_ok());
    }

    #[tokio::test]
    async fn frames_go_to_every_target_in_order() {
        let (a_tx, _a_rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        let (b_tx, _b_rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        let targets = [target("b2", &a_tx), target("c3", &b_tx)];
        let id = send_bulk(&targets, &image(b"0123456789"), &config())
            .await
            .expect("send");

        for channel in [&a_tx, &b_tx] {
            let sent = channel.sent_messages();
            assert_eq!(sent.len(), 5);
            match (&sent[0], &sent[4]) {
                (ChannelMessage::Text(start), ChannelMessage::Text(end)) => {
                    assert!(start.contains("\"totalChunks\":3"));
                    assert!(end.contains(&id));
                }
                other => panic!("unexpected frames {other:?}"),
            }
            assert_eq!(sent[3], ChannelMessage::Binary(Bytes::from_static(b"89")));
        }
    }

    #[tokio::test]
    async fn closed_target_fails_before_any_frame() {
        let (open_tx, _open_rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        let (closed_tx, _closed_rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        closed_tx.close().await.expect("close");
        let targets = [target("b2", &open_tx), target("c3", &closed_tx)];
        let err = send_bulk(&targets, &image(b"data"), &config())
            .await
            .expect_err("not ready");
        assert_eq!(
            err,
            TransferError::PeersNotReady {
                peers: vec!["c3".into()]
            }
        );
        assert!(open_tx.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn no_targets_is_not_ready() {
        let err = send_bulk(&[], &image(b"data"), &config())
            .await
            .expect_err("no peers");
        assert!(matches!(err, TransferError::PeersNotReady { .. }));
    }

    #[tokio::test]
    async fn chunks_wait_while_channel_is_over_high_water() {
        let (tx, _rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        let config = MeshConfig {
            backpressure_timeout: Duration::from_secs(30),
            ..config()
        };
        tx.set_buffered_amount_low_threshold(config.buffered_low_water)
            .await;
        tx.set_buffered_amount(5_000);

        let send = {
            let targets = vec![target("b2", &tx)];
            let config = config.clone();
            tokio::spawn(async move { send_bulk(&targets, &image(b"abcdefgh"), &config).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tx.sent_messages().len(), 1);
        assert_eq!(tx.sent_binary_count(), 0);

        tx.set_buffered_amount(50);
        send.await.expect("join").expect("send");
        assert_eq!(tx.sent_binary_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_to_one_peer_do_not_interleave() {
        let (tx, _rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        tx.set_buffered_amount_low_threshold(100).await;
        tx.set_buffered_amount(5_000);
        let config = MeshConfig {
            backpressure_timeout: Duration::from_millis(10),
            ..config()
        };
        let sender = BulkSender::new();
        let targets = [target("b2", &tx)];
        let image_a = image(b"AAAAAAAA");
        let image_b = image(b"BBBBBBBB");
        let (first, second) = tokio::join!(
            sender.send(&targets, &image_a, &config),
            sender.send(&targets, &image_b, &config),
        );
        let first = first.expect("first send");
        let second = second.expect("second send");

        let mut receiver = BulkReceiver::new(1024);
        let mut completed = Vec::new();
        for message in tx.sent_messages() {
            if let Some(done) = receiver.ingest("a1", message).expect("ingest") {
                completed.push((done.id, done.bytes));
            }
        }
        assert_eq!(
            completed,
            vec![
                (first, Bytes::from_static(b"AAAAAAAA")),
                (second, Bytes::from_static(b"BBBBBBBB")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_timeout_sends_anyway() {
        let (tx, _rx) = MockChannel::pair(AUX_CHANNEL_LABEL);
        tx.set_buffered_amount_low_threshold(100).await;
        tx.set_buffered_amount(5_000);
        let started = tokio::time::Instant::now();
        send_bulk(&[target("b2", &tx)], &image(b"abcdefgh"), &config())
            .await
            .expect("send");
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(tx.sent_binary_count(), 2);
    }
}
