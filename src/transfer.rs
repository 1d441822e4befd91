//! File transfer: chunking on the send side, reassembly on the receive
//! side, both riding on ordinary mesh messages.
//!
//! Chunks are flooded like any other message, so a lost chunk is simply
//! lost — the mesh is best-effort and transfers inherit that. There is no
//! retry or ack; an incomplete transfer just never reaches `Complete`.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{MeshError, Result};
use crate::events::{EventSender, NodeEvent};
use crate::identity::NodeIdentity;
use crate::message::codec::MAX_CHUNK_SIZE;
use crate::message::{MeshMessage, Payload};
use crate::relay::RelayEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Requested,
    Accepted,
    Rejected,
    InProgress,
    Complete,
    Failed,
}

/// Which end of the transfer this node is, and the side-specific state.
#[derive(Debug, Clone)]
pub enum TransferSide {
    /// We are streaming the file out.
    Sending { path: PathBuf },
    /// We were offered the file. `save_path` is set on accept.
    Receiving {
        save_path: Option<PathBuf>,
        received_chunks: HashSet<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct FileTransferState {
    pub file_id: Uuid,
    pub peer_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub status: TransferStatus,
    pub side: TransferSide,
}

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Byte length of chunk `chunk_num` (the last chunk is usually short).
pub fn chunk_span(size: u64, chunk_size: u32, chunk_num: u32) -> usize {
    let start = chunk_num as u64 * chunk_size as u64;
    let end = (start + chunk_size as u64).min(size);
    end.saturating_sub(start) as usize
}

pub struct FileTransferManager {
    identity: Arc<NodeIdentity>,
    relay: Arc<RelayEngine>,
    events: EventSender,
    config: Config,
    transfers: DashMap<Uuid, FileTransferState>,
}

impl FileTransferManager {
    pub fn new(
        identity: Arc<NodeIdentity>,
        relay: Arc<RelayEngine>,
        events: EventSender,
        config: Config,
    ) -> Self {
        Self {
            identity,
            relay,
            events,
            config,
            transfers: DashMap::new(),
        }
    }

    /// Consume FILE_INFO / FILE_CHUNK messages until the channel closes or
    /// the node stops. The relay dispatches into the sending half from its
    /// handler.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<MeshMessage>,
        mut running: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                msg = inbox.recv() => msg,
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(msg) = msg else { break };
            match &msg.payload {
                Payload::FileInfo {
                    file_id,
                    filename,
                    size,
                    chunk_size,
                    total_chunks,
                } => {
                    self.on_file_info(
                        &msg.sender_id,
                        *file_id,
                        filename,
                        *size,
                        *chunk_size,
                        *total_chunks,
                    );
                }
                Payload::FileChunk {
                    file_id,
                    chunk_num,
                    data,
                    ..
                } => {
                    self.on_chunk(*file_id, *chunk_num, data).await;
                }
                other => debug!("transfer worker ignoring {:?}", other.kind()),
            }
        }
        debug!("transfer worker stopped");
    }


    /// Sender side: announce the file, then stream its chunks with a small
    /// pause between sends so the shared link keeps breathing.
    pub async fn send_file(
        self: &Arc<Self>,
        path: &Path,
        chunk_size: Option<u32>,
        target_id: Option<String>,
    ) -> Result<Uuid> {
        let chunk_size = chunk_size.unwrap_or(self.config.chunk_size);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(MeshError::ChunkTooLarge(chunk_size));
        }

        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();
        let total_chunks = chunk_count(size, chunk_size);
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let file_id = Uuid::new_v4();

        let mut info = MeshMessage::new(
            &self.identity.node_id,
            Payload::FileInfo {
                file_id,
                filename: filename.clone(),
                size,
                chunk_size,
                total_chunks,
            },
            self.config.default_ttl,
        );
        if let Some(target) = &target_id {
            info = info.with_target(target.clone());
        }
        self.relay.send(info).await?;

        self.transfers.insert(
            file_id,
            FileTransferState {
                file_id,
                peer_id: target_id.clone().unwrap_or_default(),
                filename,
                total_size: size,
                chunk_size,
                total_chunks,
                status: TransferStatus::InProgress,
                side: TransferSide::Sending {
                    path: path.to_path_buf(),
                },
            },
        );

        let manager = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            match manager
                .stream_chunks(file_id, &path, size, chunk_size, total_chunks, target_id)
                .await
            {
                Ok(()) => {
                    info!("file {file_id} fully handed to the mesh");
                    manager.set_status(file_id, TransferStatus::Complete);
                }
                Err(err) => {
                    warn!("file transfer {file_id} failed: {err}");
                    manager.set_status(file_id, TransferStatus::Failed);
                }
            }
        });

        Ok(file_id)
    }

    async fn stream_chunks(
        &self,
        file_id: Uuid,
        path: &Path,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
        target_id: Option<String>,
    ) -> Result<()> {
        let mut file = File::open(path).await?;

        for chunk_num in 0..total_chunks {
            // Pace ahead of the send, so receivers get at least one delay
            // between the offer and the first chunk to accept in.
            tokio::time::sleep(self.config.chunk_send_delay()).await;

            let span = chunk_span(size, chunk_size, chunk_num);
            let mut data = vec![0u8; span];
            file.read_exact(&mut data).await?;

            let mut chunk = MeshMessage::new(
                &self.identity.node_id,
                Payload::FileChunk {
                    file_id,
                    chunk_num,
                    total_chunks,
                    data,
                },
                self.config.default_ttl,
            );
            if let Some(target) = &target_id {
                chunk = chunk.with_target(target.clone());
            }
            self.relay.send(chunk).await?;
        }
        Ok(())
    }

    fn on_file_info(
        &self,
        sender_id: &str,
        file_id: Uuid,
        filename: &str,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
    ) {
        if self.transfers.contains_key(&file_id) {
            // Re-flooded FILE_INFO after cache eviction; the transfer is
            // already tracked.
            return;
        }

        self.transfers.insert(
            file_id,
            FileTransferState {
                file_id,
                peer_id: sender_id.to_string(),
                filename: filename.to_string(),
                total_size: size,
                chunk_size,
                total_chunks,
                status: TransferStatus::Requested,
                side: TransferSide::Receiving {
                    save_path: None,
                    received_chunks: HashSet::new(),
                },
            },
        );
        info!("file offered by {sender_id}: {filename} ({size} bytes, {total_chunks} chunks)");
        let _ = self.events.send(NodeEvent::FileInfoReceived {
            file_id,
            sender_id: sender_id.to_string(),
            filename: filename.to_string(),
            size,
            total_chunks,
        });
    }

    /// Accept an offered file; chunks arriving from now on are written to
    /// `save_path`.
    pub fn accept_file(&self, file_id: Uuid, save_path: impl Into<PathBuf>) -> Result<()> {
        let mut entry = self
            .transfers
            .get_mut(&file_id)
            .ok_or(MeshError::UnknownTransfer(file_id))?;
        // Reborrow so the match can split the borrow across the guard's
        // fields.
        let state = &mut *entry;
        match (&state.status, &mut state.side) {
            (TransferStatus::Requested, TransferSide::Receiving { save_path: slot, .. }) => {
                let path: PathBuf = save_path.into();
                // Truncate whatever is already at the destination. Chunks
                // land at offsets, so the tail of a longer pre-existing
                // file would otherwise survive reassembly.
                std::fs::File::create(&path)?;
                *slot = Some(path);
                // An empty file has no chunks to wait for.
                state.status = if state.total_chunks == 0 {
                    TransferStatus::Complete
                } else {
                    TransferStatus::Accepted
                };
                let status = state.status;
                drop(entry);
                let _ = self
                    .events
                    .send(NodeEvent::TransferUpdated { file_id, status });
                Ok(())
            }
            _ => Err(MeshError::TransferState {
                file_id,
                action: "accept",
            }),
        }
    }

    pub fn reject_file(&self, file_id: Uuid) -> Result<()> {
        let mut state = self
            .transfers
            .get_mut(&file_id)
            .ok_or(MeshError::UnknownTransfer(file_id))?;
        match (&state.status, &state.side) {
            (TransferStatus::Requested, TransferSide::Receiving { .. }) => {
                state.status = TransferStatus::Rejected;
                drop(state);
                let _ = self.events.send(NodeEvent::TransferUpdated {
                    file_id,
                    status: TransferStatus::Rejected,
                });
                Ok(())
            }
            _ => Err(MeshError::TransferState {
                file_id,
                action: "reject",
            }),
        }
    }

    async fn on_chunk(&self, file_id: Uuid, chunk_num: u32, data: &[u8]) {
        // Copy what the write needs out of the map; file i/o must not run
        // under the shard lock.
        let (save_path, chunk_size) = {
            let Some(state) = self.transfers.get(&file_id) else {
                debug!("chunk for unknown transfer {file_id}");
                return;
            };
            match (&state.status, &state.side) {
                (
                    TransferStatus::Accepted | TransferStatus::InProgress,
                    TransferSide::Receiving {
                        save_path: Some(path),
                        ..
                    },
                ) => (path.clone(), state.chunk_size),
                _ => {
                    debug!("chunk {chunk_num} for transfer {file_id} in non-accepting state");
                    return;
                }
            }
        };

        if let Err(err) = write_chunk(&save_path, chunk_num, chunk_size, data).await {
            warn!("writing chunk {chunk_num} of {file_id} failed: {err}");
            self.set_status(file_id, TransferStatus::Failed);
            return;
        }

        let completed = {
            let Some(mut state) = self.transfers.get_mut(&file_id) else {
                return;
            };
            state.status = TransferStatus::InProgress;
            let total = state.total_chunks;
            if let TransferSide::Receiving {
                received_chunks, ..
            } = &mut state.side
            {
                received_chunks.insert(chunk_num);
                received_chunks.len() as u32 == total
            } else {
                false
            }
        };

        if completed {
            info!("file {file_id} reassembled at {}", save_path.display());
            self.set_status(file_id, TransferStatus::Complete);
        }
    }

    fn set_status(&self, file_id: Uuid, status: TransferStatus) {
        if let Some(mut state) = self.transfers.get_mut(&file_id) {
            state.status = status;
        }
        let _ = self
            .events
            .send(NodeEvent::TransferUpdated { file_id, status });
    }

    /// Read-only copy of a transfer's state.
    pub fn transfer(&self, file_id: Uuid) -> Option<FileTransferState> {
        self.transfers.get(&file_id).map(|state| state.clone())
    }

    pub fn transfers(&self) -> Vec<FileTransferState> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

async fn write_chunk(
    path: &Path,
    chunk_num: u32,
    chunk_size: u32,
    data: &[u8],
) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(chunk_num as u64 * chunk_size as u64))
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
