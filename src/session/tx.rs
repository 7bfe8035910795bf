//! Sender-side session.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::fileinfo::FileInfo;
use crate::journal::Journal;
use crate::pipeline::{Reader, Segment, Sender};
use crate::queue::{BlockQueue, BoundedQueue, BLOCK_QUEUE_DEPTH};

use super::{SessionConfig, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, READ_TASK_LIMIT};

/// Orchestrates the sender side: one sender task per data connection, all
/// draining a shared queue fed by per-file readers.
pub struct TxSession {
    config: SessionConfig,
    pool: BufferPool,
    queue: BlockQueue,
    cancel: CancellationToken,
    streams: Vec<TcpStream>,
    senders: JoinSet<Result<()>>,
    journal: Option<Arc<Journal>>,
    info: Vec<FileInfo>,
}

impl TxSession {
    /// Connect every data-channel target.
    pub async fn connect(config: SessionConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let streams = crate::net::connect_targets(&config.targets)
            .await
            .context("connect data targets")?;

        tracing::info!(targets = streams.len(), "connected tx targets");

        let pool = BufferPool::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_COUNT)?;
        let queue = BoundedQueue::bounded(BLOCK_QUEUE_DEPTH);

        Ok(Self {
            config,
            pool,
            queue,
            cancel: cancel.child_token(),
            streams,
            senders: JoinSet::new(),
            journal: None,
            info: Vec::new(),
        })
    }

    /// Create the journal (when configured) and spawn the sender set.
    pub fn start(&mut self, info: Vec<FileInfo>) -> anyhow::Result<()> {
        if let Some(path) = &self.config.journal_path {
            let journal = Arc::new(
                Journal::create(path, &info)
                    .with_context(|| format!("create journal {}", path.display()))?,
            );
            self.journal = Some(journal);
        }

        for stream in self.streams.drain(..) {
            let mut sender = Sender::new(stream, self.queue.clone(), self.cancel.clone());

            if let Some(journal) = &self.journal {
                sender = sender.with_journal(Arc::clone(journal));
            }

            self.senders.spawn(sender.run());
        }

        self.info = info;

        Ok(())
    }

    /// Submit a reader per regular file, then wait for the senders to drain
    /// the queue.
    ///
    /// Sender exits are watched throughout: one dead channel is survivable
    /// while others still drain the queue, but once every sender is gone
    /// the readers would wedge on a full queue, so the session cancels.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let slots = Arc::new(Semaphore::new(READ_TASK_LIMIT));
        let mut readers: JoinSet<Result<()>> = JoinSet::new();

        let sender_count = self.senders.len();
        let mut senders_done = 0usize;
        let mut senders_failed = 0usize;

        let info = std::mem::take(&mut self.info);

        'submit: for item in &info {
            // skip things we don't send, like directories and empty files
            if !item.status.is_regular() || item.status.size == 0 {
                continue;
            }

            // wait out backpressure in short slices so cancellation and
            // sender failures surface here
            let permit = loop {
                if self.cancel.is_cancelled() {
                    break 'submit;
                }

                while let Some(res) = self.senders.try_join_next() {
                    senders_done += 1;
                    if let Err(e) = res.context("sender task")? {
                        tracing::warn!(%e, "data channel failed");
                        senders_failed += 1;
                    }
                }

                if sender_count > 0 && senders_done == sender_count {
                    self.cancel.cancel();
                    anyhow::bail!("all data channels ended before the transfer completed");
                }

                match tokio::time::timeout(
                    Duration::from_millis(100),
                    Arc::clone(&slots).acquire_owned(),
                )
                .await
                {
                    Ok(permit) => break permit?,
                    Err(_) => continue,
                }
            };

            let file = open_source(
                &self.config.path_root,
                &item.path,
                self.config.use_direct_io,
            )
            .with_context(|| format!("open source file '{}'", item.path))?;

            tracing::debug!(id = item.id, path = %item.path, size = item.status.size,
                "tx opened file");

            let reader = Reader::new(
                Arc::new(file),
                item.id,
                Segment::whole_file(item.status.size),
                self.pool.clone(),
                self.queue.clone(),
                self.cancel.clone(),
            );

            readers.spawn(async move {
                let _permit = permit;
                reader.run().await
            });
        }

        loop {
            tokio::select! {
                next = readers.join_next() => match next {
                    None => break,
                    Some(res) => res.context("reader task")?.context("read")?,
                },
                Some(res) = self.senders.join_next() => {
                    senders_done += 1;
                    if let Err(e) = res.context("sender task")? {
                        tracing::warn!(%e, "data channel failed");
                        senders_failed += 1;
                    }

                    if senders_done == sender_count {
                        self.cancel.cancel();
                        anyhow::bail!("all data channels ended before the transfer completed");
                    }
                }
            }
        }

        // every block has been submitted; close the queue so the senders
        // drain it and exit
        self.queue.close();

        while let Some(res) = self.senders.join_next().await {
            senders_done += 1;
            if let Err(e) = res.context("sender task")? {
                tracing::warn!(%e, "data channel failed");
                senders_failed += 1;
            }
        }

        if sender_count > 0 && senders_failed == sender_count {
            anyhow::bail!("all {sender_count} data channels failed");
        }

        Ok(())
    }

    /// Cancel outstanding tasks and sync the journal.
    pub async fn finish(&mut self) -> anyhow::Result<()> {
        tracing::debug!("tx session: cancelling read and send tasks");

        self.cancel.cancel();
        self.queue.cancel();
        self.pool.cancel();

        while let Some(res) = self.senders.join_next().await {
            if let Ok(Err(e)) = res {
                tracing::debug!(%e, "sender ended during shutdown");
            }
        }

        if let Some(journal) = &self.journal {
            let journal = Arc::clone(journal);
            tokio::task::spawn_blocking(move || journal.sync())
                .await?
                .context("sync journal")?;
        }

        Ok(())
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }
}

fn open_source(root: &Path, rel: &str, direct_io: bool) -> Result<fs::File> {
    let path = if root.is_file() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };

    let mut opts = fs::OpenOptions::new();
    opts.read(true);
    if direct_io {
        opts.custom_flags(libc::O_DIRECT);
    }

    Ok(opts.open(path)?)
}
