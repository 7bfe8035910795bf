//! Slab-backed buffer pool.
//!
//! All pipeline payloads live in one anonymous, pre-faulted mapping carved
//! into equal blocks. `get` hands out owning handles; dropping a handle
//! returns its slot to the free list and wakes one waiter.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

const PAGE_SIZE: usize = 4096;

struct PoolShared {
    // Keeps the mapping alive; `base` points into it and stays stable for
    // the life of the pool.
    _map: MmapMut,
    base: *mut u8,
    block_size: usize,
    block_count: usize,
    free_tx: async_channel::Sender<usize>,
    free_rx: async_channel::Receiver<usize>,
    done: AtomicBool,
}

// Each slot index is owned by at most one Buffer at a time, so the slab
// ranges handed out never alias.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

/// Fixed pool of `block_count` blocks of `block_size` bytes each.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        let len = (block_size * block_count).max(1);
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let mut opts = MmapOptions::new();
        opts.len(len);
        #[cfg(target_os = "linux")]
        opts.populate();
        let mut map = opts.map_anon()?;

        let base = map.as_mut_ptr();

        let (free_tx, free_rx) = async_channel::bounded(block_count.max(1));
        for idx in 0..block_count {
            // The channel is sized to hold every index.
            let _ = free_tx.try_send(idx);
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                _map: map,
                base,
                block_size,
                block_count,
                free_tx,
                free_rx,
                done: AtomicBool::new(false),
            }),
        })
    }

    /// Wait for a free block. Returns `None` once the pool is cancelled.
    pub async fn get(&self) -> Option<Buffer> {
        if self.shared.done.load(Ordering::Acquire) {
            return None;
        }

        let idx = self.shared.free_rx.recv().await.ok()?;

        // cancelled while waiting: hand out nothing
        if self.shared.done.load(Ordering::Acquire) {
            return None;
        }

        Some(self.buffer(idx))
    }

    /// Like [`get`](Self::get), but gives up after `timeout`.
    pub async fn get_deadline(&self, timeout: Duration) -> Option<Buffer> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }

    pub fn try_get(&self) -> Option<Buffer> {
        if self.shared.done.load(Ordering::Acquire) {
            return None;
        }

        self.shared.free_rx.try_recv().ok().map(|idx| self.buffer(idx))
    }

    /// Wake all waiters; pending and future `get`s return `None`.
    pub fn cancel(&self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.free_tx.close();
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn block_count(&self) -> usize {
        self.shared.block_count
    }

    /// Blocks currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.shared.free_rx.len()
    }

    fn buffer(&self, idx: usize) -> Buffer {
        Buffer {
            idx,
            len: self.shared.block_size,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Exclusive handle to one slab block.
///
/// Move-only; the slot returns to the pool when the handle drops. The block's
/// base pointer and length are stable for the handle's lifetime.
pub struct Buffer {
    idx: usize,
    len: usize,
    shared: Arc<PoolShared>,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_index(&self) -> usize {
        self.idx
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        debug_assert!(self.idx < self.shared.block_count);
        unsafe {
            std::slice::from_raw_parts(
                self.shared.base.add(self.idx * self.shared.block_size),
                self.len,
            )
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.idx < self.shared.block_count);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.shared.base.add(self.idx * self.shared.block_size),
                self.len,
            )
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Fails only after cancel, when the slab is being torn down anyway.
        let _ = self.shared.free_tx.try_send(self.idx);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("idx", &self.idx)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_basic() {
        let pool = BufferPool::new(4096, 4).unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.block_size(), 4096);

        let mut buf = pool.get().await.unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.available(), 3);

        buf[0] = 0xAA;
        buf[4095] = 0x55;
        assert_eq!(buf[0], 0xAA);

        drop(buf);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let pool = BufferPool::new(4096, 1).unwrap();

        let held = pool.get().await.unwrap();
        let got = pool.get_deadline(Duration::from_millis(20)).await;
        assert!(got.is_none());

        drop(held);
        assert!(pool.get_deadline(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_pool_cancel_wakes_waiters() {
        let pool = BufferPool::new(4096, 1).unwrap();
        let _held = pool.get().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.cancel();

        assert!(waiter.await.unwrap().is_none());
        assert!(pool.get().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_conservation_under_load() {
        let pool = BufferPool::new(4096, 8).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut buf = pool.get().await.unwrap();
                    buf[0] = buf[0].wrapping_add(1);
                    drop(buf);
                }
            }));
        }

        for t in tasks {
            t.await.unwrap();
        }

        // every index is back on the free list
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    async fn test_buffers_do_not_alias() {
        let pool = BufferPool::new(4096, 2).unwrap();

        let mut a = pool.get().await.unwrap();
        let mut b = pool.get().await.unwrap();
        assert_ne!(a.free_index(), b.free_index());

        a.fill(0x11);
        b.fill(0x22);
        assert!(a.iter().all(|&x| x == 0x11));
        assert!(b.iter().all(|&x| x == 0x22));
    }
}
