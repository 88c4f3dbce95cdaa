// Log positions and the entries cursors hand out to dispatchers.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Locator of one stored record: ledger first, then entry within the ledger.
///
/// Ordering is lexicographic on `(ledger_id, entry_id)`, which is what the derived
/// `Ord` gives us given the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl Position {
    pub const EARLIEST: Position = Position::new(0, 0);

    pub const fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }

    /// Smallest position strictly greater than `self` inside the same ledger.
    pub fn next(&self) -> Position {
        Position::new(self.ledger_id, self.entry_id.saturating_add(1))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// Marker carried by every part of a multi-part ("chunked") message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkInfo {
    pub uuid: String,
    pub chunk_id: u32,
    pub num_chunks: u32,
}

impl ChunkInfo {
    pub fn new(uuid: impl Into<String>, chunk_id: u32, num_chunks: u32) -> Self {
        Self {
            uuid: uuid.into(),
            chunk_id,
            num_chunks,
        }
    }

    pub fn is_first(&self) -> bool {
        self.chunk_id == 0
    }

    pub fn is_last(&self) -> bool {
        self.chunk_id.saturating_add(1) >= self.num_chunks
    }
}

/// Parsed per-entry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    // Logical messages batched into this entry.
    pub num_messages: u32,
    pub chunk: Option<ChunkInfo>,
    // Scheduled delivery time (unix millis), if the producer asked for one.
    pub deliver_at_millis: Option<u64>,
    pub sticky_key_hash: Option<u32>,
    // Batch indexes the subscription already acknowledged individually.
    pub acked_batch_indexes: u32,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            num_messages: 1,
            chunk: None,
            deliver_at_millis: None,
            sticky_key_hash: None,
            acked_batch_indexes: 0,
        }
    }
}

impl EntryMetadata {
    pub fn batch(num_messages: u32) -> Self {
        Self {
            num_messages: num_messages.max(1),
            ..Self::default()
        }
    }

    pub fn with_chunk(mut self, chunk: ChunkInfo) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_deliver_at(mut self, deliver_at_millis: u64) -> Self {
        self.deliver_at_millis = Some(deliver_at_millis);
        self
    }

    pub fn with_sticky_key_hash(mut self, hash: u32) -> Self {
        self.sticky_key_hash = Some(hash);
        self
    }

    pub fn with_acked_batch_indexes(mut self, acked: u32) -> Self {
        self.acked_batch_indexes = acked;
        self
    }
}

/// RAII handle counting an entry buffer lent out by the log.
///
/// The count goes up on creation and down exactly once on drop, no matter which
/// path (send, rewind, error) disposes of the owning [`Entry`].
#[derive(Debug)]
pub struct EntryLease {
    outstanding: Arc<AtomicUsize>,
}

impl EntryLease {
    pub fn new(outstanding: Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::AcqRel);
        Self { outstanding }
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One stored record borrowed from the log.
///
/// Intentionally not `Clone`: an entry is released when it is dropped, and there must
/// only ever be one owner to do that.
#[derive(Debug)]
pub struct Entry {
    position: Position,
    payload: Bytes,
    metadata: EntryMetadata,
    lease: Option<EntryLease>,
}

impl Entry {
    pub fn new(position: Position, payload: Bytes, metadata: EntryMetadata) -> Self {
        Self {
            position,
            payload,
            metadata,
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: EntryLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    pub fn num_messages(&self) -> u32 {
        self.metadata.num_messages
    }

    pub fn is_chunk(&self) -> bool {
        self.metadata.chunk.is_some()
    }

    /// Gives the buffer back to the log. Same as dropping, spelled out at call sites
    /// where the release is the point.
    pub fn release(self) {
        drop(self);
    }
}
