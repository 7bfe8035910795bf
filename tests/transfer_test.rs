//! End-to-end transfers over localhost.
//!
//! Both sides run in-process: the receiver binds its data listeners on
//! port 0, the sender learns the bound addresses, and the transfer request
//! travels over a real control socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use draft::journal::diff_journals;
use draft::session::{RxSession, SessionConfig, TxSession, VerifyConfig};
use draft::{fileinfo, session, wire, Journal, NetworkTarget};

/// Serialize transfers; each one maps two full buffer pools.
fn transfer_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn loopback(port: u16) -> NetworkTarget {
    NetworkTarget {
        host: "127.0.0.1".to_string(),
        port,
    }
}

struct TransferOutcome {
    accepted_connections: u64,
}

/// Drive one complete transfer of `tx_root` into `rx_root` over `channels`
/// parallel data connections.
async fn run_transfer(
    tx_root: &Path,
    rx_root: &Path,
    channels: usize,
    tx_journal: Option<PathBuf>,
    rx_journal: Option<PathBuf>,
) -> anyhow::Result<TransferOutcome> {
    let _guard = transfer_lock().lock().await;

    let cancel = CancellationToken::new();

    let rx_config = SessionConfig {
        targets: vec![loopback(0); channels],
        service: loopback(0),
        path_root: rx_root.to_path_buf(),
        use_direct_io: false,
        journal_path: rx_journal,
        no_write: false,
    };

    let mut rx = RxSession::bind(rx_config, cancel.clone()).await?;
    let data_addrs = rx.data_addrs()?;

    let control_listener = TcpListener::bind("127.0.0.1:0").await?;
    let control_addr = control_listener.local_addr()?;

    let rx_task = tokio::spawn(async move {
        let (mut control, _) = control_listener.accept().await?;
        let info = wire::read_transfer_request(&mut control).await?;

        rx.start(info)?;
        rx.run().await?;
        rx.finish().await?;

        anyhow::Ok(TransferOutcome {
            accepted_connections: rx.accepted_connections(),
        })
    });

    let info = fileinfo::scan(tx_root)?;

    let mut control = TcpStream::connect(control_addr).await?;
    wire::send_transfer_request(&mut control, &info).await?;

    let tx_config = SessionConfig {
        targets: data_addrs.iter().map(|a| loopback(a.port())).collect(),
        service: loopback(control_addr.port()),
        path_root: tx_root.to_path_buf(),
        use_direct_io: false,
        journal_path: tx_journal,
        no_write: false,
    };

    let mut tx = TxSession::connect(tx_config, cancel).await?;
    tx.start(info)?;
    tx.run().await?;
    tx.finish().await?;

    Ok(rx_task.await??)
}

fn assert_files_equal(a: &Path, b: &Path) {
    let data_a = fs::read(a).unwrap();
    let data_b = fs::read(b).unwrap();

    assert_eq!(data_a.len(), data_b.len(), "size mismatch for {}", b.display());
    assert!(data_a == data_b, "content mismatch for {}", b.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_file_transfer() {
    let tx_dir = TempDir::new().unwrap();
    let rx_dir = TempDir::new().unwrap();

    let src = tx_dir.path().join("small.bin");
    fs::write(&src, vec![0x55u8; 12289]).unwrap();

    let before = draft::stats::stats()
        .net_byte_count
        .load(std::sync::atomic::Ordering::Relaxed);

    run_transfer(&src, rx_dir.path(), 1, None, None)
        .await
        .unwrap();

    let dst = rx_dir.path().join("small.bin");
    let data = fs::read(&dst).unwrap();
    assert_eq!(data.len(), 12289);
    assert!(data.iter().all(|&b| b == 0x55));

    let after = draft::stats::stats()
        .net_byte_count
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(after - before >= 12289);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_channels() {
    let tx_dir = TempDir::new().unwrap();
    let rx_dir = TempDir::new().unwrap();

    // 64 MiB, patterned so misplaced blocks are detectable
    let mut data = vec![0u8; 64 * 1024 * 1024];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i / 4096) as u8 ^ (i % 251) as u8;
    }

    let src = tx_dir.path().join("big.bin");
    fs::write(&src, &data).unwrap();

    let outcome = run_transfer(&src, rx_dir.path(), 4, None, None)
        .await
        .unwrap();

    assert_eq!(outcome.accepted_connections, 4);

    let received = fs::read(rx_dir.path().join("big.bin")).unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_directory_tree_transfer() {
    let tx_dir = TempDir::new().unwrap();
    let rx_dir = TempDir::new().unwrap();

    fs::create_dir_all(tx_dir.path().join("a/c")).unwrap();
    fs::write(tx_dir.path().join("a/b.txt"), "hello").unwrap();
    fs::write(tx_dir.path().join("a/c/d.bin"), vec![0u8; 4096]).unwrap();

    run_transfer(tx_dir.path(), rx_dir.path(), 2, None, None)
        .await
        .unwrap();

    assert_eq!(
        fs::read_to_string(rx_dir.path().join("a/b.txt")).unwrap(),
        "hello"
    );

    let d = fs::read(rx_dir.path().join("a/c/d.bin")).unwrap();
    assert_eq!(d.len(), 4096);
    assert!(d.iter().all(|&b| b == 0));

    assert_files_equal(
        &tx_dir.path().join("a/b.txt"),
        &rx_dir.path().join("a/b.txt"),
    );
    assert_files_equal(
        &tx_dir.path().join("a/c/d.bin"),
        &rx_dir.path().join("a/c/d.bin"),
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_journaled_transfer_and_verify() {
    let tx_dir = TempDir::new().unwrap();
    let rx_dir = TempDir::new().unwrap();
    let journal_dir = TempDir::new().unwrap();

    fs::create_dir_all(tx_dir.path().join("sub")).unwrap();
    fs::write(tx_dir.path().join("one.bin"), vec![0xa1u8; 100_000]).unwrap();
    fs::write(tx_dir.path().join("sub/two.bin"), vec![0xb2u8; 12289]).unwrap();

    let tx_journal_path = journal_dir.path().join("tx.draft");
    let rx_journal_path = journal_dir.path().join("rx.draft");

    run_transfer(
        tx_dir.path(),
        rx_dir.path(),
        2,
        Some(tx_journal_path.clone()),
        Some(rx_journal_path.clone()),
    )
    .await
    .unwrap();

    let tx_journal = Journal::open(&tx_journal_path).unwrap();
    let rx_journal = Journal::open(&rx_journal_path).unwrap();

    assert!(tx_journal.hash_count().unwrap() >= 2);
    assert_eq!(
        tx_journal.hash_count().unwrap(),
        rx_journal.hash_count().unwrap()
    );

    // both sides hashed identical payloads
    assert!(diff_journals(&tx_journal, &rx_journal).unwrap().is_empty());

    // the receiver's files re-hash to the same journal
    let diffs = session::verify_journal(
        &rx_journal,
        VerifyConfig::new(rx_dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(diffs.is_empty());

    // flip one byte and the verifier pins the damaged range
    let victim = rx_dir.path().join("one.bin");
    let mut data = fs::read(&victim).unwrap();
    data[70_000] ^= 0xff;
    fs::write(&victim, data).unwrap();

    let diffs = session::verify_journal(
        &rx_journal,
        VerifyConfig::new(rx_dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].offset <= 70_000 && 70_000 < diffs[0].offset + diffs[0].size);
    assert_ne!(diffs[0].hash_a, diffs[0].hash_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_journal_from_local_files() {
    let data_dir = TempDir::new().unwrap();
    let journal_dir = TempDir::new().unwrap();

    fs::write(data_dir.path().join("x.bin"), vec![0x42u8; 50_000]).unwrap();

    let info = fileinfo::scan(data_dir.path()).unwrap();
    let path = journal_dir.path().join("local.draft");

    let journal = session::create_journal(
        info,
        &path,
        VerifyConfig::new(data_dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(journal.path(), path);
    assert!(path.exists());
    assert_eq!(journal.hash_count().unwrap(), 1);

    // a journal created from the files verifies clean against them
    let diffs = session::verify_journal(
        &journal,
        VerifyConfig::new(data_dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(diffs.is_empty());
}
