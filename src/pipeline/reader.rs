//! Sender-side disk reader.

use std::fs;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::{DraftError, Result};
use crate::queue::{BlockDescriptor, BlockQueue, PutStatus};
use crate::stats::{file_stats, stats};
use crate::wire::round_block_size;

use super::STAGE_DEADLINE;

/// Byte sub-range of a file assigned to one reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub len: u64,
}

impl Segment {
    pub fn whole_file(len: u64) -> Self {
        Self { offset: 0, len }
    }
}

/// Reads one file segment in block-aligned chunks and feeds the queue.
///
/// Each iteration acquires a pooled buffer (time-sliced so cancellation
/// stays responsive), reads at the current offset, and enqueues the block,
/// retrying while the queue pushes back rather than stacking up more reads.
pub struct Reader {
    file: Arc<fs::File>,
    file_id: u16,
    cur: u64,
    end: u64,
    pool: BufferPool,
    queue: BlockQueue,
    hash_queue: Option<BlockQueue>,
    cancel: CancellationToken,
}

impl Reader {
    pub fn new(
        file: Arc<fs::File>,
        file_id: u16,
        segment: Segment,
        pool: BufferPool,
        queue: BlockQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            file,
            file_id,
            cur: segment.offset,
            end: segment.offset + segment.len,
            pool,
            queue,
            hash_queue: None,
            cancel,
        }
    }

    /// Attach a secondary queue that receives a non-blocking copy of every
    /// block for hashing.
    pub fn with_hash_queue(mut self, queue: BlockQueue) -> Self {
        self.hash_queue = Some(queue);
        self
    }

    pub async fn run(mut self) -> Result<()> {
        while !self.cancel.is_cancelled() && self.cur < self.end {
            let Some(buf) = self.pool.get_deadline(STAGE_DEADLINE).await else {
                tracing::trace!(file_id = self.file_id, "reader: timed out waiting for buffer");
                continue;
            };

            let want = (buf.len() as u64).min(round_block_size(self.end - self.cur)) as usize;
            let offset = self.cur;

            let file = Arc::clone(&self.file);
            let (buf, read) = tokio::task::spawn_blocking(move || {
                let mut buf = buf;
                let read = read_chunk(&file, &mut buf[..want], offset);
                (buf, read)
            })
            .await
            .map_err(join_error)?;

            let len = read?;
            if len == 0 {
                break;
            }

            tracing::trace!(
                file_id = self.file_id,
                offset,
                len,
                remaining = self.end - offset,
                "reader progress"
            );

            stats().disk_byte_count.fetch_add(len as u64, Ordering::Relaxed);
            if let Some(s) = file_stats(self.file_id) {
                s.disk_byte_count.fetch_add(len as u64, Ordering::Relaxed);
            }

            let desc = BlockDescriptor {
                buf: Arc::new(buf),
                file_id: self.file_id,
                offset,
                len: len as u64,
            };

            // keep trying to push this block; if the queue is pushing back
            // we don't want to stack up more reads behind it.
            loop {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }

                match self.queue.put_deadline(desc.clone(), STAGE_DEADLINE).await {
                    PutStatus::Ok => break,
                    PutStatus::TimedOut | PutStatus::Full => continue,
                    PutStatus::Closed => return Ok(()),
                }
            }

            if let Some(hash_queue) = &self.hash_queue {
                if hash_queue.try_put(desc.clone()) != PutStatus::Ok {
                    tracing::warn!(
                        file_id = self.file_id,
                        offset,
                        len,
                        "reader: unable to enqueue block for hashing (queue full)"
                    );
                }
            }

            stats().queued_block_count.fetch_add(1, Ordering::Relaxed);
            if let Some(s) = file_stats(self.file_id) {
                s.queued_block_count.fetch_add(1, Ordering::Relaxed);
            }

            self.cur = offset + len as u64;
        }

        Ok(())
    }
}

/// Positioned read that retries short reads; returns the bytes gathered
/// before EOF.
fn read_chunk(file: &fs::File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }

    Ok(done)
}

fn join_error(e: tokio::task::JoinError) -> DraftError {
    DraftError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BoundedQueue;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reader_chunks_whole_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");

        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&vec![0x5au8; 10_000]).unwrap();

        let pool = BufferPool::new(4096, 8).unwrap();
        let queue = BoundedQueue::bounded(16);
        let cancel = CancellationToken::new();

        let file = Arc::new(fs::File::open(&path).unwrap());
        let reader = Reader::new(
            file,
            3,
            Segment::whole_file(10_000),
            pool,
            queue.clone(),
            cancel,
        );

        reader.run().await.unwrap();
        queue.close();

        let mut total = 0u64;
        let mut expected_offset = 0u64;
        while let Some(desc) = queue.get().await {
            assert_eq!(desc.file_id, 3);
            assert_eq!(desc.offset, expected_offset);
            assert!(desc.buf[..desc.len as usize].iter().all(|&b| b == 0x5a));
            expected_offset += desc.len;
            total += desc.len;
        }

        assert_eq!(total, 10_000);
    }

    #[tokio::test]
    async fn test_reader_last_block_is_short() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, vec![1u8; 5000]).unwrap();

        // one block per buffer
        let pool = BufferPool::new(4096, 4).unwrap();
        let queue = BoundedQueue::bounded(16);

        let reader = Reader::new(
            Arc::new(fs::File::open(&path).unwrap()),
            1,
            Segment::whole_file(5000),
            pool,
            queue.clone(),
            CancellationToken::new(),
        );

        reader.run().await.unwrap();
        queue.close();

        let first = queue.get().await.unwrap();
        assert_eq!(first.len, 4096);

        let last = queue.get().await.unwrap();
        assert_eq!(last.offset, 4096);
        assert_eq!(last.len, 904);

        assert!(queue.get().await.is_none());
    }
}
