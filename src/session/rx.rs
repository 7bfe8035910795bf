//! Receiver-side session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::fileinfo::{self, FileInfo, TargetFile};
use crate::journal::Journal;
use crate::pipeline::{Hasher, Receiver, Writer};
use crate::queue::{BlockQueue, BoundedQueue, BLOCK_QUEUE_DEPTH, HASH_QUEUE_DEPTH};

use super::{SessionConfig, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};

/// Orchestrates the receiver side: one receiver task per pre-bound data
/// listener, one writer owning every destination file, and hashers when
/// journaling.
pub struct RxSession {
    config: SessionConfig,
    pool: BufferPool,
    queue: BlockQueue,
    hash_queue: Option<BlockQueue>,
    cancel: CancellationToken,
    listeners: Vec<TcpListener>,
    receivers: JoinSet<Result<u64>>,
    writer: Option<JoinHandle<Result<HashMap<u16, TargetFile>>>>,
    hashers: JoinSet<Result<()>>,
    journal: Option<Arc<Journal>>,
    targets: Option<HashMap<u16, TargetFile>>,
    accepted: u64,
}

impl RxSession {
    /// Bind every data-channel listener up front, so the sender can connect
    /// as soon as it learns the addresses.
    pub async fn bind(config: SessionConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let listeners = crate::net::bind_targets(&config.targets)
            .await
            .context("bind data targets")?;

        let pool = BufferPool::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_COUNT)?;
        let queue = BoundedQueue::bounded(BLOCK_QUEUE_DEPTH);

        Ok(Self {
            config,
            pool,
            queue,
            hash_queue: None,
            cancel: cancel.child_token(),
            listeners,
            receivers: JoinSet::new(),
            writer: None,
            hashers: JoinSet::new(),
            journal: None,
            targets: None,
            accepted: 0,
        })
    }

    /// Bound data-listener addresses, in target order.
    pub fn data_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|l| l.local_addr().map_err(crate::error::DraftError::from))
            .collect()
    }

    /// Materialize the announced files and spawn the receiver, writer, and
    /// hasher tasks.
    pub fn start(&mut self, info: Vec<FileInfo>) -> anyhow::Result<()> {
        let targets = fileinfo::create_target_files(
            &self.config.path_root,
            &info,
            self.config.use_direct_io,
        )
        .context("create target files")?;

        if let Some(path) = &self.config.journal_path {
            let journal = Arc::new(
                Journal::create(path, &info)
                    .with_context(|| format!("create journal {}", path.display()))?,
            );

            let hash_queue: BlockQueue = BoundedQueue::bounded(HASH_QUEUE_DEPTH);

            self.hashers.spawn(
                Hasher::new(hash_queue.clone(), Arc::clone(&journal), self.cancel.clone()).run(),
            );

            self.hash_queue = Some(hash_queue);
            self.journal = Some(journal);
        }

        tracing::debug!(receivers = self.listeners.len(), "starting receivers");

        for listener in self.listeners.drain(..) {
            let mut receiver = Receiver::new(
                listener,
                self.pool.clone(),
                self.queue.clone(),
                self.cancel.clone(),
            );

            if let Some(hash_queue) = &self.hash_queue {
                receiver = receiver.with_hash_queue(hash_queue.clone());
            }

            self.receivers.spawn(receiver.run());
        }

        let mut writer = Writer::new(targets, self.queue.clone(), self.cancel.clone());
        if self.config.no_write {
            writer = writer.no_writes();
        }
        self.writer = Some(tokio::spawn(writer.run()));

        Ok(())
    }

    /// Wait until every data channel has delivered its stream, then drain
    /// the writer and hashers.
    ///
    /// The writer is watched alongside the receivers: if it dies early the
    /// receivers would wedge on a full write queue, so the session cancels
    /// and the writer's error surfaces.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut writer = self.writer.take();

        loop {
            tokio::select! {
                next = self.receivers.join_next() => match next {
                    None => break,
                    Some(res) => match res.context("receiver task")? {
                        Ok(accepted) => self.accepted += accepted,
                        // one dead channel doesn't end the session; the
                        // others may still carry the remaining data
                        Err(e) => tracing::warn!(%e, "data channel failed"),
                    },
                },
                res = async { writer.as_mut().expect("guarded").await }, if writer.is_some() => {
                    let result = res.context("writer task")?;
                    writer = None;

                    match result {
                        Ok(targets) => {
                            // only reachable when shutdown got here first
                            self.targets = Some(targets);
                        }
                        Err(e) => {
                            self.cancel.cancel();
                            return Err(e).context("write");
                        }
                    }
                }
            }
        }

        self.queue.close();
        if let Some(hash_queue) = &self.hash_queue {
            hash_queue.close();
        }

        if let Some(handle) = writer {
            let targets = handle.await.context("writer task")?.context("write")?;
            self.targets = Some(targets);
        }

        while let Some(res) = self.hashers.join_next().await {
            res.context("hasher task")?.context("hash")?;
        }

        Ok(())
    }

    /// Stop outstanding tasks, truncate every target back to its announced
    /// size, and sync the journal.
    pub async fn finish(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.pool.cancel();

        self.join_writer().await?;

        while let Some(res) = self.receivers.join_next().await {
            if let Ok(Ok(accepted)) = res {
                self.accepted += accepted;
            }
        }
        while let Some(res) = self.hashers.join_next().await {
            if let Ok(Err(e)) = res {
                tracing::debug!(%e, "hasher ended during shutdown");
            }
        }

        self.truncate_targets().await?;

        if let Some(journal) = &self.journal {
            let journal = Arc::clone(journal);
            tokio::task::spawn_blocking(move || journal.sync())
                .await?
                .context("sync journal")?;
        }

        Ok(())
    }

    /// Data connections accepted across all receivers.
    pub fn accepted_connections(&self) -> u64 {
        self.accepted
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    async fn join_writer(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.writer.take() {
            let targets = handle.await.context("writer task")?.context("write")?;
            self.targets = Some(targets);
        }

        Ok(())
    }

    /// Block-aligned writes overshoot on the last block of each file; trim
    /// every target back to its declared size.
    async fn truncate_targets(&mut self) -> anyhow::Result<()> {
        let Some(targets) = self.targets.take() else {
            return Ok(());
        };

        if self.config.no_write {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || {
            for target in targets.values() {
                tracing::debug!(path = %target.path.display(), size = target.size, "truncate");

                if let Err(e) = target.file.set_len(target.size) {
                    tracing::warn!(path = %target.path.display(), size = target.size, %e,
                        "unable to truncate target file");
                }
            }
        })
        .await?;

        Ok(())
    }
}
