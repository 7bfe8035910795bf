//! Destination writer.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{DraftError, Result};
use crate::fileinfo::TargetFile;
use crate::queue::{BlockDescriptor, BlockQueue};
use crate::stats::{file_stats, stats};
use crate::wire::round_block_size;

/// The single owner of every destination file. Drains the write queue and
/// lands each block at its header-declared offset with a positioned write.
///
/// Writes cover the block-rounded length; the session's final truncate pass
/// trims the overshoot on the last block of each file.
pub struct Writer {
    targets: HashMap<u16, TargetFile>,
    queue: BlockQueue,
    writes_enabled: bool,
    cancel: CancellationToken,
    do_finalize: bool,
}

impl Writer {
    pub fn new(
        targets: HashMap<u16, TargetFile>,
        queue: BlockQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            targets,
            queue,
            writes_enabled: true,
            cancel,
            do_finalize: true,
        }
    }

    /// Disable disk writes; descriptors are consumed without side effect.
    pub fn no_writes(mut self) -> Self {
        self.writes_enabled = false;
        self
    }

    pub fn finalize_on_stop(mut self, do_finalize: bool) -> Self {
        self.do_finalize = do_finalize;
        self
    }

    /// Drains until the queue closes; hands the target map back for the
    /// final truncate pass.
    pub async fn run(mut self) -> Result<HashMap<u16, TargetFile>> {
        loop {
            let desc = tokio::select! {
                _ = self.cancel.cancelled() => break,
                desc = self.queue.get() => match desc {
                    Some(desc) => desc,
                    None => break,
                },
            };

            self.write_block(desc).await?;
        }

        if self.do_finalize {
            while let Some(desc) = self.queue.try_get_final() {
                self.write_block(desc).await?;
            }
        }

        Ok(self.targets)
    }

    async fn write_block(&mut self, desc: BlockDescriptor) -> Result<()> {
        stats().dequeued_block_count.fetch_add(1, Ordering::Relaxed);
        if let Some(s) = file_stats(desc.file_id) {
            s.dequeued_block_count.fetch_add(1, Ordering::Relaxed);
        }

        if !self.writes_enabled {
            stats().disk_byte_count.fetch_add(desc.len, Ordering::Relaxed);
            return Ok(());
        }

        let Some(target) = self.targets.get(&desc.file_id) else {
            tracing::error!(file_id = desc.file_id, "no target file for id");
            return Ok(());
        };

        let len = round_block_size(desc.len).min(desc.buf.len() as u64) as usize;
        let offset = desc.offset;

        tracing::trace!(file_id = desc.file_id, offset, len, "write block");

        let file = Arc::clone(&target.file);
        let buf = Arc::clone(&desc.buf);
        let written = tokio::task::spawn_blocking(move || write_chunk(&file, &buf[..len], offset))
            .await
            .map_err(|e| DraftError::Io(std::io::Error::other(e)))??;

        stats().disk_byte_count.fetch_add(written as u64, Ordering::Relaxed);
        if let Some(s) = file_stats(desc.file_id) {
            s.disk_byte_count.fetch_add(written as u64, Ordering::Relaxed);
        }

        Ok(())
    }
}

/// Positioned write that re-issues until the whole chunk has landed.
fn write_chunk(file: &fs::File, buf: &[u8], offset: u64) -> Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        let n = file.write_at(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(DraftError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "zero-length positioned write",
            )));
        }
        done += n;
    }

    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::queue::BoundedQueue;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn target(dir: &TempDir, name: &str, size: u64) -> (PathBuf, TargetFile) {
        let path = dir.path().join(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        (
            path.clone(),
            TargetFile {
                path,
                file: Arc::new(file),
                size,
            },
        )
    }

    #[tokio::test]
    async fn test_writer_places_blocks_at_offsets() {
        let tmp = TempDir::new().unwrap();
        let (path, target) = target(&tmp, "out.bin", 8192);

        let queue = BoundedQueue::bounded(4);
        let pool = BufferPool::new(4096, 4).unwrap();

        let mut targets = HashMap::new();
        targets.insert(5u16, target);

        let writer = Writer::new(targets, queue.clone(), CancellationToken::new());
        let task = tokio::spawn(writer.run());

        // out-of-order arrival; offsets make it benign
        for (offset, fill) in [(4096u64, 0xbbu8), (0u64, 0xaau8)] {
            let mut buf = pool.get().await.unwrap();
            buf.fill(fill);
            queue
                .put(BlockDescriptor {
                    buf: Arc::new(buf),
                    file_id: 5,
                    offset,
                    len: 4096,
                })
                .await;
        }

        queue.close();
        task.await.unwrap().unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 8192);
        assert!(data[..4096].iter().all(|&b| b == 0xaa));
        assert!(data[4096..].iter().all(|&b| b == 0xbb));
    }

    #[tokio::test]
    async fn test_writer_no_disk_mode() {
        let tmp = TempDir::new().unwrap();
        let (path, target) = target(&tmp, "out.bin", 4096);

        let queue = BoundedQueue::bounded(4);
        let pool = BufferPool::new(4096, 2).unwrap();

        let mut targets = HashMap::new();
        targets.insert(1u16, target);

        let writer = Writer::new(targets, queue.clone(), CancellationToken::new()).no_writes();
        let task = tokio::spawn(writer.run());

        let mut buf = pool.get().await.unwrap();
        buf.fill(0xff);
        queue
            .put(BlockDescriptor {
                buf: Arc::new(buf),
                file_id: 1,
                offset: 0,
                len: 4096,
            })
            .await;

        queue.close();
        task.await.unwrap().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
