//! Transfer orchestration.
//!
//! A session bundles the pool, queues, and stage tasks for one direction of
//! a transfer. The top-level [`send`] and [`recv`] entry points own the
//! control channel (one CBOR transfer request behind a chunk header) and
//! drive a session to completion.

mod rx;
mod tx;
mod verify;

pub use rx::RxSession;
pub use tx::TxSession;
pub use verify::{create_journal, verify_journal, VerifyConfig};

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::fileinfo::FileInfo;
use crate::net::NetworkTarget;
use crate::stats::{file_stats, reallocate_file_stats, stats};
use crate::{fileinfo, net, wire};

/// Size of each pooled payload buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 22;

/// Buffers per pool.
pub const DEFAULT_BUFFER_COUNT: usize = 35;

/// Concurrent reader tasks per session.
pub(crate) const READ_TASK_LIMIT: usize = 4;

const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Data-channel endpoints; one socket (and one sender/receiver task)
    /// per entry.
    pub targets: Vec<NetworkTarget>,

    /// Control-channel endpoint.
    pub service: NetworkTarget,

    /// Transfer root: the path to send, or the directory received files
    /// land under.
    pub path_root: PathBuf,

    pub use_direct_io: bool,

    /// Journal per-block hashes to this path.
    pub journal_path: Option<PathBuf>,

    /// Consume received blocks without writing them.
    pub no_write: bool,
}

impl SessionConfig {
    pub fn new(targets: Vec<NetworkTarget>, service: NetworkTarget) -> Self {
        Self {
            targets,
            service,
            path_root: PathBuf::from("."),
            use_direct_io: true,
            journal_path: None,
            no_write: false,
        }
    }
}

fn update_file_stats(infos: &[FileInfo]) {
    for info in infos {
        if !info.status.is_regular() {
            continue;
        }

        stats()
            .file_byte_count
            .fetch_add(info.status.size, Ordering::Relaxed);

        if let Some(s) = file_stats(info.id) {
            s.file_byte_count.store(info.status.size, Ordering::Relaxed);
        }
    }
}

/// Log the process-wide counters at the end of a run.
pub fn dump_stats() {
    let s = stats();

    tracing::info!(
        file_byte_count = s.file_byte_count.load(Ordering::Relaxed),
        disk_byte_count = s.disk_byte_count.load(Ordering::Relaxed),
        net_byte_count = s.net_byte_count.load(Ordering::Relaxed),
        queued_block_count = s.queued_block_count.load(Ordering::Relaxed),
        dequeued_block_count = s.dequeued_block_count.load(Ordering::Relaxed),
        "transfer stats (disk counts include rx-side padding, net counts tx-side padding)"
    );
}

/// Send `config.path_root` to the receiver: announce the file set over the
/// control channel, then stream contents over the data channels.
pub async fn send(config: SessionConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let root = config.path_root.clone();
    let info = tokio::task::spawn_blocking(move || fileinfo::scan(&root))
        .await?
        .context("scan transfer root")?;

    reallocate_file_stats(info.len());
    update_file_stats(&info);

    let mut control = net::connect_target_timeout(&config.service, CONTROL_CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("control connect to {}", config.service))?;

    wire::send_transfer_request(&mut control, &info).await?;

    let mut session = TxSession::connect(config, cancel).await?;

    tracing::info!("starting tx session");
    session.start(info)?;
    let result = session.run().await;
    session.finish().await?;
    result?;

    tracing::info!("tx session complete");
    dump_stats();

    Ok(())
}

/// Receive one transfer: bind the data listeners, await the transfer
/// request on the control channel, then write the announced files under
/// `config.path_root`.
pub async fn recv(config: SessionConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let service = config.service.clone();
    let mut session = RxSession::bind(config, cancel.clone()).await?;

    let control_listener = TcpListener::bind((service.host.as_str(), service.port))
        .await
        .with_context(|| format!("bind control listener {service}"))?;

    let (mut control, peer) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = control_listener.accept() => res.context("control accept")?,
    };

    tracing::info!(%peer, "accepted control connection");

    let info = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = wire::read_transfer_request(&mut control) => res.context("transfer request")?,
    };

    reallocate_file_stats(info.len());
    update_file_stats(&info);

    tracing::info!(files = info.len(), "starting rx session");
    session.start(info)?;
    let result = session.run().await;
    session.finish().await?;
    result?;

    tracing::info!(
        accepted = session.accepted_connections(),
        "rx session complete"
    );
    dump_stats();

    Ok(())
}
