//! Journal verification and offline creation.
//!
//! Both operations re-create a journal from local files: a read pool feeds
//! every block to hashers writing a fresh journal at a temporary path. For
//! verification the fresh journal is diffed against the input and then
//! discarded; for creation it is renamed into place.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::fileinfo::{rooted_path, FileInfo};
use crate::journal::{diff_journals, Difference, Journal};
use crate::pipeline::{Hasher, Reader, Segment};
use crate::queue::{BoundedQueue, HASH_QUEUE_DEPTH};

use super::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, READ_TASK_LIMIT};

const VERIFY_HASHERS: usize = 2;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Root the journal's file list is resolved under.
    pub path_root: PathBuf,
    pub use_direct_io: bool,
}

impl VerifyConfig {
    pub fn new(path_root: impl Into<PathBuf>) -> Self {
        Self {
            path_root: path_root.into(),
            use_direct_io: false,
        }
    }
}

/// Removes a scratch file on drop unless defused.
struct TempPathGuard {
    path: PathBuf,
    armed: bool,
}

impl TempPathGuard {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempPathGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn scratch_path(base: &Path, tag: &str) -> PathBuf {
    PathBuf::from(format!("{}.{tag}.{}", base.display(), std::process::id()))
}

/// Re-hash the journal's file set under `config.path_root` and report every
/// block range that disagrees.
pub async fn verify_journal(
    journal: &Journal,
    config: VerifyConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<Difference>> {
    let info = journal.file_info().context("journal file info")?;

    let tmp_path = scratch_path(journal.path(), "verify");
    let guard = TempPathGuard::new(&tmp_path);

    let fresh = hash_local_files(info, &tmp_path, &config, cancel).await?;

    let diffs = diff_journals(journal, &fresh).context("diff journals")?;

    drop(fresh);
    drop(guard);

    Ok(diffs)
}

/// Hash local files into a new journal at `path`. The journal is built at a
/// temporary sibling path and renamed into place once complete.
pub async fn create_journal(
    info: Vec<FileInfo>,
    path: &Path,
    config: VerifyConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Journal> {
    let tmp_path = scratch_path(path, "tmp");
    let guard = TempPathGuard::new(&tmp_path);

    let mut journal = hash_local_files(info, &tmp_path, &config, cancel).await?;

    journal
        .rename(path)
        .with_context(|| format!("rename journal into place at {}", path.display()))?;
    guard.defuse();

    Ok(journal)
}

/// The shared re-hash pipeline: readers over the local files feeding a hash
/// queue, hashers writing the fresh journal.
async fn hash_local_files(
    info: Vec<FileInfo>,
    journal_path: &Path,
    config: &VerifyConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Journal> {
    let cancel = cancel.child_token();

    let journal = Arc::new(
        Journal::create(journal_path, &info)
            .with_context(|| format!("create journal {}", journal_path.display()))?,
    );

    let pool = BufferPool::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_COUNT)?;
    let hash_queue = BoundedQueue::bounded(HASH_QUEUE_DEPTH);

    let mut hashers: JoinSet<Result<()>> = JoinSet::new();
    for _ in 0..VERIFY_HASHERS {
        hashers.spawn(
            Hasher::new(hash_queue.clone(), Arc::clone(&journal), cancel.clone()).run(),
        );
    }

    let slots = Arc::new(Semaphore::new(READ_TASK_LIMIT));
    let mut readers: JoinSet<Result<()>> = JoinSet::new();

    for item in &info {
        if !item.status.is_regular() || item.status.size == 0 {
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => permit?,
        };

        let path = rooted_path(&config.path_root, &item.path, &item.target_suffix);

        let mut opts = fs::OpenOptions::new();
        opts.read(true);
        if config.use_direct_io {
            opts.custom_flags(libc::O_DIRECT);
        }
        let file = opts
            .open(&path)
            .with_context(|| format!("open '{}'", path.display()))?;

        tracing::debug!(id = item.id, path = %path.display(), "verifier opened file");

        // the hash queue is the primary output here, so enqueueing is
        // lossless
        let reader = Reader::new(
            Arc::new(file),
            item.id,
            Segment::whole_file(item.status.size),
            pool.clone(),
            hash_queue.clone(),
            cancel.clone(),
        );

        readers.spawn(async move {
            let _permit = permit;
            reader.run().await
        });
    }

    while let Some(res) = readers.join_next().await {
        res.context("reader task")?.context("read")?;
    }

    hash_queue.close();

    while let Some(res) = hashers.join_next().await {
        res.context("hasher task")?.context("hash")?;
    }

    {
        let journal = Arc::clone(&journal);
        tokio::task::spawn_blocking(move || journal.sync())
            .await?
            .context("sync journal")?;
    }

    Arc::try_unwrap(journal).map_err(|_| anyhow::anyhow!("journal still shared after drain"))
}
