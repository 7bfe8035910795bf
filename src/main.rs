use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use draft::journal::ops::{self, OutputFormat};
use draft::{fileinfo, session, Journal, NetworkTarget, SessionConfig, VerifyConfig};

#[derive(Parser)]
#[command(name = "draft", version, about = "Parallel bulk file transfer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file or directory tree to a receiver
    Send(TransferArgs),
    /// Receive a transfer
    Recv(TransferArgs),
    /// Inspect, diff, verify, or create hash journals
    Journal(JournalArgs),
}

#[derive(Args)]
struct TransferArgs {
    /// IP and port to use for control messages
    #[arg(short, long)]
    service: NetworkTarget,

    /// IP and port for data transfer; repeat to parallelize traffic over
    /// multiple routes
    #[arg(short, long = "target", required = true)]
    targets: Vec<NetworkTarget>,

    /// Transfer path root
    #[arg(short, long, default_value = ".")]
    path: PathBuf,

    /// Enable hash journaling at the default journal path
    #[arg(short, long)]
    journal: bool,

    /// Enable hash journaling at the given path
    #[arg(short = 'J', long)]
    journal_path: Option<PathBuf>,

    /// Disable direct I/O, for filesystems that don't support it
    #[arg(short, long)]
    nodirect: bool,

    /// Disable writes to disk (receive side)
    #[arg(short = 'N', long)]
    nowrites: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DumpKind {
    Birthdate,
    Hashes,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Standard,
    Csv,
}

impl From<FormatArg> for OutputFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Standard => OutputFormat::Standard,
            FormatArg::Csv => OutputFormat::Csv,
        }
    }
}

#[derive(Args)]
struct JournalArgs {
    /// What to dump from the listed journals
    #[arg(short, long = "dump", value_enum)]
    dump: Vec<DumpKind>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "standard")]
    format: FormatArg,

    /// Diff two journals
    #[arg(long, num_args = 2, value_names = ["A", "B"])]
    diff: Option<Vec<PathBuf>>,

    /// Verify a journal against local files under --path
    #[arg(long)]
    verify: Option<PathBuf>,

    /// Create a journal from local files under --path
    #[arg(long)]
    create: Option<PathBuf>,

    /// Local path root for --verify and --create
    #[arg(short, long, default_value = ".")]
    path: PathBuf,

    /// Journal files to dump
    journals: Vec<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Send,
    Recv,
}

fn default_journal_path(root: &PathBuf, mode: TransferMode) -> PathBuf {
    let name = match mode {
        TransferMode::Send => "tx_journal.draft",
        TransferMode::Recv => "rx_journal.draft",
    };

    if root.is_dir() {
        root.join(name)
    } else {
        PathBuf::from(format!("{}_{name}", root.display()))
    }
}

fn session_config(args: &TransferArgs, mode: TransferMode) -> SessionConfig {
    let journal_path = match (&args.journal_path, args.journal) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => {
            let path = default_journal_path(&args.path, mode);
            tracing::info!(path = %path.display(), "using default journal path");
            Some(path)
        }
        (None, false) => None,
    };

    SessionConfig {
        targets: args.targets.clone(),
        service: args.service.clone(),
        path_root: args.path.clone(),
        use_direct_io: !args.nodirect,
        journal_path,
        no_write: args.nowrites,
    }
}

/// First interrupt requests a cooperative shutdown; the second one ends the
/// process immediately.
fn install_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        tracing::warn!("interrupted - shutting down");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("draft: interrupted twice - ending transfer NOW");
            std::process::exit(2);
        }
    });
}

async fn run_journal(args: JournalArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let format: OutputFormat = args.format.into();
    let mut out = std::io::stdout().lock();

    if let Some(paths) = &args.diff {
        let a = Journal::open(&paths[0])
            .with_context(|| format!("open journal '{}'", paths[0].display()))?;
        let b = Journal::open(&paths[1])
            .with_context(|| format!("open journal '{}'", paths[1].display()))?;

        let count = ops::dump_diff(&a, &b, format, &mut out)?;
        tracing::info!(differences = count, "journal diff complete");
    }

    if let Some(path) = &args.verify {
        let journal =
            Journal::open(path).with_context(|| format!("open journal '{}'", path.display()))?;

        let diffs = session::verify_journal(
            &journal,
            VerifyConfig {
                path_root: args.path.clone(),
                use_direct_io: false,
            },
            cancel.clone(),
        )
        .await?;

        for d in &diffs {
            println!(
                "file {} @ {} for {}: {:#018x} != {:#018x}",
                d.file_id, d.offset, d.size, d.hash_a, d.hash_b
            );
        }
        tracing::info!(differences = diffs.len(), "journal verify complete");
    }

    if let Some(path) = &args.create {
        let root = args.path.clone();
        let info = tokio::task::spawn_blocking(move || fileinfo::scan(&root))
            .await?
            .context("scan path root")?;

        let journal = session::create_journal(
            info,
            path,
            VerifyConfig {
                path_root: args.path.clone(),
                use_direct_io: false,
            },
            cancel.clone(),
        )
        .await?;

        let hashes = journal.hash_count()?;
        tracing::info!(path = %journal.path().display(), hashes, "journal created");
    }

    for path in &args.journals {
        let journal =
            Journal::open(path).with_context(|| format!("open journal '{}'", path.display()))?;

        for kind in &args.dump {
            match kind {
                DumpKind::Birthdate => ops::dump_birthdate(&journal, format, &mut out)?,
                DumpKind::Info => ops::dump_file_info(&journal, format, &mut out)?,
                DumpKind::Hashes => ops::dump_hashes(&journal, format, &mut out)?,
            }
        }
    }

    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    match cli.command {
        Command::Send(args) => {
            let config = session_config(&args, TransferMode::Send);
            session::send(config, cancel).await
        }
        Command::Recv(args) => {
            let config = session_config(&args, TransferMode::Recv);
            session::recv(config, cancel).await
        }
        Command::Journal(args) => run_journal(args, cancel).await,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("draft=info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap renders its own message; usage errors exit 1
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("draft: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
