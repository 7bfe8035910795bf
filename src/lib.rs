//! Parallel bulk file transfer with a verifiable hash journal.
//!
//! A sender walks a source path, announces the file set over a control
//! connection, and streams block-aligned chunks over N parallel TCP data
//! connections; the receiver pre-allocates the files and lands each chunk
//! at its header-declared offset, so cross-channel reordering is benign.
//! Either side can journal a 64-bit hash per block; two journals (or a
//! journal and the local files) can then be diffed down to the exact
//! disagreeing ranges.
//!
//! # Architecture
//!
//! ```text
//! tx:  Reader -> [queue] -> Sender  --tcp-->  Receiver -> [queue] -> Writer   :rx
//!        \-> [hash queue] -> Hasher -> Journal    \-> [hash queue] -> Hasher -> Journal
//! ```
//!
//! Stages talk only through bounded queues over a pooled slab allocator;
//! every socket and file is owned by exactly one task.

pub mod buffer;
pub mod error;
pub mod fileinfo;
pub mod journal;
pub mod net;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod stats;
pub mod wire;

pub use buffer::{Buffer, BufferPool};
pub use error::{DraftError, Result};
pub use fileinfo::{FileInfo, FileStatus};
pub use journal::{diff_journals, Cursor, Difference, HashRecord, Journal, RecordIter, Whence};
pub use net::NetworkTarget;
pub use queue::{BlockDescriptor, BlockQueue, BoundedQueue};
pub use session::{
    create_journal, recv, send, verify_journal, RxSession, SessionConfig, TxSession, VerifyConfig,
};
pub use wire::{ChunkFlags, ChunkHeader, TransferRequest};
