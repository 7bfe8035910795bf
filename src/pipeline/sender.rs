//! Data-channel sender.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::journal::Journal;
use crate::queue::{BlockDescriptor, BlockQueue};
use crate::stats::{file_stats, stats};
use crate::wire::ChunkHeader;

/// Drains the shared block queue onto one data socket, framing each block
/// with a chunk header. With a journal attached, every payload's xxh3
/// digest is appended before the block goes out.
pub struct Sender {
    stream: TcpStream,
    queue: BlockQueue,
    journal: Option<Arc<Journal>>,
    cancel: CancellationToken,
    do_finalize: bool,
}

impl Sender {
    pub fn new(stream: TcpStream, queue: BlockQueue, cancel: CancellationToken) -> Self {
        Self {
            stream,
            queue,
            journal: None,
            cancel,
            do_finalize: true,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn finalize_on_stop(mut self, do_finalize: bool) -> Self {
        self.do_finalize = do_finalize;
        self
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let desc = tokio::select! {
                _ = self.cancel.cancelled() => break,
                desc = self.queue.get() => match desc {
                    Some(desc) => desc,
                    None => break,
                },
            };

            self.send_block(&desc).await?;
        }

        if self.do_finalize {
            while let Some(desc) = self.queue.try_get_final() {
                self.send_block(&desc).await?;
            }
        }

        Ok(())
    }

    async fn send_block(&mut self, desc: &BlockDescriptor) -> Result<()> {
        stats().dequeued_block_count.fetch_add(1, Ordering::Relaxed);
        if let Some(s) = file_stats(desc.file_id) {
            s.dequeued_block_count.fetch_add(1, Ordering::Relaxed);
        }

        let payload = &desc.buf[..desc.len as usize];

        if let Some(journal) = &self.journal {
            let digest = xxh3_64(payload);
            journal.write_hash(desc.file_id, desc.offset, desc.len, digest)?;
        }

        let header = ChunkHeader::new(desc.file_id, desc.offset, desc.len);
        self.stream.write_all(&header.encode()).await?;
        self.stream.write_all(payload).await?;

        tracing::trace!(
            file_id = desc.file_id,
            offset = desc.offset,
            len = desc.len,
            "sent chunk"
        );

        stats().net_byte_count.fetch_add(desc.len, Ordering::Relaxed);
        if let Some(s) = file_stats(desc.file_id) {
            s.net_byte_count.fetch_add(desc.len, Ordering::Relaxed);
        }

        Ok(())
    }
}
