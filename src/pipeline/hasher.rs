//! Block hasher.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::journal::Journal;
use crate::queue::{BlockDescriptor, BlockQueue};

/// Drains the hash queue and records `(file_id, offset, len, xxh3)` for
/// every non-empty block into the journal. Several hashers may share one
/// journal; each record appends whole.
pub struct Hasher {
    queue: BlockQueue,
    journal: Arc<Journal>,
    cancel: CancellationToken,
    do_finalize: bool,
}

impl Hasher {
    pub fn new(queue: BlockQueue, journal: Arc<Journal>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            journal,
            cancel,
            do_finalize: true,
        }
    }

    /// When false, cancellation ends the task immediately instead of
    /// flushing the queued blocks first.
    pub fn finalize_on_stop(mut self, do_finalize: bool) -> Self {
        self.do_finalize = do_finalize;
        self
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let desc = tokio::select! {
                _ = self.cancel.cancelled() => break,
                desc = self.queue.get() => match desc {
                    Some(desc) => desc,
                    None => break,
                },
            };

            self.hash_block(&desc)?;
        }

        if self.do_finalize {
            while let Some(desc) = self.queue.try_get_final() {
                self.hash_block(&desc)?;
            }
        }

        Ok(())
    }

    fn hash_block(&self, desc: &BlockDescriptor) -> Result<()> {
        if desc.len == 0 {
            return Ok(());
        }

        let digest = xxh3_64(&desc.buf[..desc.len as usize]);

        tracing::trace!(
            file_id = desc.file_id,
            offset = desc.offset,
            len = desc.len,
            digest,
            "hashed block"
        );

        self.journal
            .write_hash(desc.file_id, desc.offset, desc.len, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::queue::BoundedQueue;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_hasher_records_digests() {
        let tmp = TempDir::new().unwrap();
        let journal = Arc::new(Journal::create(tmp.path().join("j.draft"), &[]).unwrap());

        let queue = BoundedQueue::bounded(4);
        let pool = BufferPool::new(4096, 2).unwrap();

        let hasher = Hasher::new(queue.clone(), Arc::clone(&journal), CancellationToken::new());
        let task = tokio::spawn(hasher.run());

        let mut buf = pool.get().await.unwrap();
        buf.fill(0x55);
        queue
            .put(BlockDescriptor {
                buf: Arc::new(buf),
                file_id: 9,
                offset: 8192,
                len: 4096,
            })
            .await;

        queue.close();
        task.await.unwrap().unwrap();

        assert_eq!(journal.hash_count().unwrap(), 1);

        let record = journal.records().unwrap().next().unwrap().unwrap();
        assert_eq!(record.file_id, 9);
        assert_eq!(record.offset, 8192);
        assert_eq!(record.size, 4096);
        assert_eq!(record.hash, xxh3_64(&[0x55u8; 4096]));
    }

    #[tokio::test]
    async fn test_hasher_skips_empty_blocks() {
        let tmp = TempDir::new().unwrap();
        let journal = Arc::new(Journal::create(tmp.path().join("j.draft"), &[]).unwrap());

        let queue = BoundedQueue::bounded(4);
        let pool = BufferPool::new(4096, 2).unwrap();

        let hasher = Hasher::new(queue.clone(), Arc::clone(&journal), CancellationToken::new());
        let task = tokio::spawn(hasher.run());

        let buf = pool.get().await.unwrap();
        queue
            .put(BlockDescriptor {
                buf: Arc::new(buf),
                file_id: 1,
                offset: 0,
                len: 0,
            })
            .await;

        queue.close();
        task.await.unwrap().unwrap();

        assert_eq!(journal.hash_count().unwrap(), 0);
    }
}
