use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use parley_proto::{BulkControl, decode_control};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::TransferError;
use crate::transport::ChannelMessage;

/// Key of one inbound transfer: (peer id, transfer id).
pub type TransferKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub received_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    EndFrame,
    ChunkCount,
    ByteCount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub peer_id: String,
    pub id: String,
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
    pub reason: CompletionReason,
}

#[derive(Debug)]
struct IncomingTransfer {
    id: String,
    name: String,
    mime: String,
    size: u64,
    total_chunks: u32,
    received_chunks: u32,
    received_bytes: u64,
    data: BytesMut,
}

impl IncomingTransfer {
    fn progress(&self) -> TransferProgress {
        TransferProgress {
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.size,
            total_chunks: self.total_chunks,
            received_chunks: self.received_chunks,
            received_bytes: self.received_bytes,
        }
    }

    fn completion(&self) -> Option<CompletionReason> {
        if self.received_chunks >= self.total_chunks {
            Some(CompletionReason::ChunkCount)
        } else if self.received_bytes >= self.size {
            Some(CompletionReason::ByteCount)
        } else {
            None
        }
    }

    fn finish(self, peer_id: &str, reason: CompletionReason) -> CompletedTransfer {
        CompletedTransfer {
            peer_id: peer_id.to_string(),
            id: self.id,
            name: self.name,
            mime: self.mime,
            bytes: self.data.freeze(),
            reason,
        }
    }
}

/// Reassembles inbound transfers per peer.
///
/// Binary frames belong to the oldest open transfer of their peer; a second start frame
/// queues behind it. Progress for every open transfer is published on a watch channel.
pub struct BulkReceiver {
    max_bytes: usize,
    open: HashMap<String, VecDeque<IncomingTransfer>>,
    progress: watch::Sender<BTreeMap<TransferKey, TransferProgress>>,
}

impl BulkReceiver {
    pub fn new(max_bytes: usize) -> Self {
        let (progress, _) = watch::channel(BTreeMap::new());
        Self {
            max_bytes,
            open: HashMap::new(),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<TransferKey, TransferProgress>> {
        self.progress.subscribe()
    }

    pub fn open_transfers(&self, peer_id: &str) -> usize {
        self.open.get(peer_id).map_or(0, VecDeque::len)
    }

    /// Feeds one aux channel frame from `peer_id`.
    pub fn ingest(
        &mut self,
        peer_id: &str,
        message: ChannelMessage,
    ) -> Result<Option<CompletedTransfer>, TransferError> {
        match message {
            ChannelMessage::Text(text) => match decode_control(&text)? {
                BulkControl::Start {
                    id,
                    name,
                    mime,
                    size,
                    chunk_size: _,
                    total_chunks,
                } => self.start(
                    peer_id,
                    IncomingTransfer {
                        id,
                        name,
                        mime,
                        size,
                        total_chunks,
                        received_chunks: 0,
                        received_bytes: 0,
                        data: BytesMut::new(),
                    },
                ),
                BulkControl::End { id } => Ok(self.end(peer_id, &id)),
            },
            ChannelMessage::Binary(chunk) => Ok(self.chunk(peer_id, chunk)),
        }
    }

    /// Forgets every open transfer of a departed peer.
    pub fn drop_peer(&mut self, peer_id: &str) {
        let Some(dropped) = self.open.remove(peer_id) else {
            return;
        };
        if !dropped.is_empty() {
            debug!(
                target: "parley::transfer",
                peer_id,
                transfers = dropped.len(),
                "dropping open transfers"
            );
        }
        self.progress.send_if_modified(|progress| {
            let before = progress.len();
            progress.retain(|(peer, _), _| peer != peer_id);
            progress.len() != before
        });
    }

    fn start(
        &mut self,
        peer_id: &str,
        transfer: IncomingTransfer,
    ) -> Result<Option<CompletedTransfer>, TransferError> {
        if transfer.size > self.max_bytes as u64 {
            warn!(
                target: "parley::transfer",
                peer_id,
                transfer_id = %transfer.id,
                size = transfer.size,
                "rejecting oversized transfer"
            );
            return Err(TransferError::PayloadTooLarge {
                size: usize::try_from(transfer.size).unwrap_or(usize::MAX),
                max: self.max_bytes,
            });
        }
        if transfer.total_chunks == 0 || transfer.size == 0 {
            return Ok(Some(transfer.finish(peer_id, CompletionReason::ChunkCount)));
        }
        debug!(
            target: "parley::transfer",
            peer_id,
            transfer_id = %transfer.id,
            size = transfer.size,
            chunks = transfer.total_chunks,
            "inbound transfer started"
        );
        let key = (peer_id.to_string(), transfer.id.clone());
        let progress = transfer.progress();
        self.open
            .entry(peer_id.to_string())
            .or_default()
            .push_back(transfer);
        self.progress.send_modify(|all| {
            all.insert(key, progress);
        });
        Ok(None)
    }

    fn chunk(&mut self, peer_id: &str, chunk: Bytes) -> Option<CompletedTransfer> {
        let Some(queue) = self.open.get_mut(peer_id) else {
            debug!(target: "parley::transfer", peer_id, "ignoring stray chunk");
            return None;
        };
        let transfer = queue.front_mut()?;
        transfer.received_chunks = transfer.received_chunks.saturating_add(1);
        transfer.received_bytes = transfer.received_bytes.saturating_add(chunk.len() as u64);
        transfer.data.extend_from_slice(&chunk);
        let key = (peer_id.to_string(), transfer.id.clone());
        let progress = transfer.progress();
        match transfer.completion() {
            Some(reason) => {
                let transfer = queue.pop_front()?;
                Some(self.finish(peer_id, transfer, reason))
            }
            None => {
                self.progress.send_modify(|all| {
                    all.insert(key, progress);
                });
                None
            }
        }
    }

    fn end(&mut self, peer_id: &str, id: &str) -> Option<CompletedTransfer> {
        let queue = self.open.get_mut(peer_id)?;
        let index = queue.iter().position(|transfer| transfer.id == id)?;
        let transfer = queue.remove(index)?;
        Some(self.finish(peer_id, transfer, CompletionReason::EndFrame))
    }

    fn finish(
        &mut self,
        peer_id: &str,
        transfer: IncomingTransfer,
        reason: CompletionReason,
    ) -> CompletedTransfer {
        if self.open.get(peer_id).is_some_and(VecDeque::is_empty) {
            self.open.remove(peer_id);
        }
        let key = (peer_id.to_string(), transfer.id.clone());
        self.progress.send_if_modified(|all| all.remove(&key).is_some());
        let completed = transfer.finish(peer_id, reason);
        info!(
            target: "parley::transfer",
            peer_id,
            transfer_id = %completed.id,
            bytes = completed.bytes.len(),
            ?reason,
            "inbound transfer completed"
        );
        completed
    }
}
