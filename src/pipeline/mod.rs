//! Pipeline stages.
//!
//! Leaves of the transfer: readers fill pooled buffers from disk, senders
//! frame them onto data sockets, receivers reassemble frames into pooled
//! buffers, the writer lands them at their declared offsets, and hashers
//! record block digests into a journal. Stages communicate only through
//! bounded queues; each socket and file has exactly one owning task.

mod hasher;
mod reader;
mod receiver;
mod sender;
mod writer;

pub use hasher::Hasher;
pub use reader::{Reader, Segment};
pub use receiver::Receiver;
pub use sender::Sender;
pub use writer::Writer;

use std::time::Duration;

/// Deadline applied to pool and queue waits so cancellation stays
/// responsive.
pub(crate) const STAGE_DEADLINE: Duration = Duration::from_millis(100);
