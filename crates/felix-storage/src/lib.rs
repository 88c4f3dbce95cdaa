// Persistent-log boundary consumed by subscription dispatchers.
// Positions, borrowed entries, the cursor contract, and an in-memory log that
// implements it for tests and local runs.
use std::future::Future;
use std::pin::Pin;

pub mod cursor;
pub mod entry;
pub mod memory;

pub use cursor::{CursorResult, ManagedCursor, ReadRequest, SkipPredicate};
pub use entry::{ChunkInfo, Entry, EntryLease, EntryMetadata, Position};
pub use memory::{MemoryCursor, MemoryLedger};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failures a cursor can report for a read or replay.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor already closed")]
    AlreadyClosed,
    #[error("no more entries to read")]
    NoMoreEntries,
    #[error("log temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("too many outstanding read requests")]
    TooManyRequests,
    #[error("invalid replay position {0}")]
    InvalidReplayPosition(Position),
    #[error("pending read cancelled")]
    Cancelled,
    #[error("read failed: {0}")]
    Read(String),
}

impl CursorError {
    /// Transient conditions that clear up on their own; retried after a fixed short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, CursorError::Unavailable(_))
    }
}
