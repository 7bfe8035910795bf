//! Data-channel receiver.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::queue::{BlockDescriptor, BlockQueue, PutStatus};
use crate::stats::{file_stats, stats};
use crate::wire::{ChunkHeader, CHUNK_HEADER_SIZE};

use super::STAGE_DEADLINE;

/// How one data connection ended.
enum ConnOutcome {
    /// Clean EOF from the peer; the receiver task is done.
    PeerClosed,
    /// Bad magic or an oversized payload; the socket was closed and the
    /// listener goes back to accepting.
    BadFrame,
    /// Session shutdown.
    Cancelled,
}

/// Owns one data listener: accepts a connection, then loops reading
/// `(ChunkHeader, payload)` frames into pooled buffers and queueing them
/// for the writer (and optionally the hashers).
pub struct Receiver {
    listener: TcpListener,
    pool: BufferPool,
    queue: BlockQueue,
    hash_queue: Option<BlockQueue>,
    cancel: CancellationToken,
    accepted: u64,
}

impl Receiver {
    pub fn new(
        listener: TcpListener,
        pool: BufferPool,
        queue: BlockQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listener,
            pool,
            queue,
            hash_queue: None,
            cancel,
            accepted: 0,
        }
    }

    pub fn with_hash_queue(mut self, queue: BlockQueue) -> Self {
        self.hash_queue = Some(queue);
        self
    }

    /// Runs until the peer closes cleanly or the session cancels. Returns
    /// the number of data connections accepted.
    pub async fn run(mut self) -> Result<u64> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(self.accepted),
                res = self.listener.accept() => res?,
            };

            self.accepted += 1;
            tracing::info!(%peer, "accepted data connection");

            match self.stream_frames(stream).await? {
                ConnOutcome::PeerClosed | ConnOutcome::Cancelled => return Ok(self.accepted),
                ConnOutcome::BadFrame => continue,
            }
        }
    }

    async fn stream_frames(&mut self, mut stream: TcpStream) -> Result<ConnOutcome> {
        let mut header_buf = vec![0u8; CHUNK_HEADER_SIZE];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(ConnOutcome::Cancelled),
                res = stream.read_exact(&mut header_buf) => res,
            };

            match read {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(ConnOutcome::PeerClosed);
                }
                Err(e) => return Err(e.into()),
            }

            let header = match ChunkHeader::decode(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    tracing::error!(%e, "closing data connection");
                    return Ok(ConnOutcome::BadFrame);
                }
            };

            if header.payload_length > self.pool.block_size() as u64 {
                tracing::error!(
                    payload_length = header.payload_length,
                    limit = self.pool.block_size(),
                    "oversized payload - closing data connection"
                );
                return Ok(ConnOutcome::BadFrame);
            }

            let mut buf = loop {
                if self.cancel.is_cancelled() {
                    return Ok(ConnOutcome::Cancelled);
                }

                if let Some(buf) = self.pool.get_deadline(STAGE_DEADLINE).await {
                    break buf;
                }
            };

            let len = header.payload_length as usize;
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(ConnOutcome::Cancelled),
                res = stream.read_exact(&mut buf[..len]) => res,
            };

            match read {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(ConnOutcome::PeerClosed);
                }
                Err(e) => return Err(e.into()),
            }

            stats().net_byte_count.fetch_add(len as u64, Ordering::Relaxed);
            if let Some(s) = file_stats(header.file_id) {
                s.net_byte_count.fetch_add(len as u64, Ordering::Relaxed);
            }

            tracing::trace!(
                file_id = header.file_id,
                offset = header.file_offset,
                len,
                "received chunk"
            );

            let desc = BlockDescriptor {
                buf: Arc::new(buf),
                file_id: header.file_id,
                offset: header.file_offset,
                len: header.payload_length,
            };

            loop {
                if self.cancel.is_cancelled() {
                    return Ok(ConnOutcome::Cancelled);
                }

                match self.queue.put_deadline(desc.clone(), STAGE_DEADLINE).await {
                    PutStatus::Ok => break,
                    PutStatus::TimedOut | PutStatus::Full => continue,
                    PutStatus::Closed => return Ok(ConnOutcome::Cancelled),
                }
            }

            stats().queued_block_count.fetch_add(1, Ordering::Relaxed);
            if let Some(s) = file_stats(header.file_id) {
                s.queued_block_count.fetch_add(1, Ordering::Relaxed);
            }

            if let Some(hash_queue) = &self.hash_queue {
                if hash_queue.try_put(desc.clone()) != PutStatus::Ok {
                    tracing::warn!(
                        file_id = header.file_id,
                        offset = header.file_offset,
                        "receiver: unable to enqueue block for hashing (queue full)"
                    );
                }
            }
        }
    }
}
