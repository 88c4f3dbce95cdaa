use std::fmt;
use std::sync::Arc;

use crate::{BoxFuture, CursorError, Entry, Position};

pub type CursorResult<T> = std::result::Result<T, CursorError>;

/// Positions a normal read should step over without returning them.
pub type SkipPredicate = Arc<dyn Fn(Position) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ReadRequest {
    pub max_entries: usize,
    pub max_bytes: u64,
    // Reads never return entries past this position (e.g. uncommitted data).
    pub max_position: Option<Position>,
    pub skip: Option<SkipPredicate>,
}

impl ReadRequest {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            max_position: None,
            skip: None,
        }
    }

    pub fn with_max_position(mut self, max_position: Option<Position>) -> Self {
        self.max_position = max_position;
        self
    }

    pub fn with_skip(mut self, skip: Option<SkipPredicate>) -> Self {
        self.skip = skip;
        self
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("max_position", &self.max_position)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

/// Subscription cursor over a persistent log.
///
/// A dispatcher owns its cursor exclusively for read/replay purposes. Reads are
/// asynchronous; everything else answers from cursor state without I/O.
pub trait ManagedCursor: Send + Sync {
    fn name(&self) -> &str;

    /// Reads forward from the read position, waiting for new entries when caught up.
    fn read_entries_or_wait(&self, request: ReadRequest) -> BoxFuture<'_, CursorResult<Vec<Entry>>>;

    /// Re-reads specific positions. Positions already deleted are silently omitted.
    fn replay_entries(
        &self,
        positions: Vec<Position>,
        in_order: bool,
    ) -> BoxFuture<'_, CursorResult<Vec<Entry>>>;

    /// The subset of `positions` that is already acknowledged and will never replay.
    fn acknowledged_positions(&self, positions: &[Position]) -> Vec<Position>;

    /// Highest position at or below which everything is acknowledged.
    fn mark_deleted_position(&self) -> Option<Position>;

    fn read_position(&self) -> Position;

    /// Returns true when a parked read was actually cancelled.
    fn cancel_pending_read(&self) -> bool;

    /// Active cursors are served from the hot tail of the log.
    fn is_active(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn entries_in_backlog(&self) -> u64;

    /// Moves the read position back to just after the mark-delete position.
    fn rewind(&self);

    /// Caps an entry count so that the expected byte size stays under `max_bytes`.
    fn apply_max_size_cap(&self, max_entries: usize, max_bytes: u64) -> usize;

    /// False while the individually-acknowledged ranges are too large to persist.
    fn is_data_fully_persistable(&self) -> bool;

    /// True when the read position moved since the last call, or sits on the tail.
    fn check_and_update_read_position_changed(&self) -> bool;
}
