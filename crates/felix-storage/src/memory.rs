// In-memory managed log plus cursor.
// Entries never leave the log; cursors track their own read position, mark-delete
// position and individually acknowledged positions on top of the shared entry map.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::cursor::{CursorResult, ManagedCursor, ReadRequest};
use crate::{BoxFuture, CursorError, Entry, EntryLease, EntryMetadata, Position};

#[derive(Debug)]
struct StoredEntry {
    payload: Bytes,
    metadata: EntryMetadata,
}

#[derive(Debug)]
struct LedgerState {
    entries: BTreeMap<Position, StoredEntry>,
    current_ledger: u64,
    next_entry_id: u64,
    total_bytes: u64,
    // Terminated logs reject appends and end reads with NoMoreEntries.
    terminated: bool,
}

/// Append-only log kept in memory.
///
/// ```
/// use bytes::Bytes;
/// use felix_storage::{EntryMetadata, ManagedCursor, MemoryLedger, Position};
///
/// let ledger = MemoryLedger::new("orders");
/// let first = ledger.append(Bytes::from_static(b"a"), EntryMetadata::default());
/// assert_eq!(first, Position::new(1, 0));
/// let cursor = ledger.open_cursor("sub");
/// assert_eq!(cursor.entries_in_backlog(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryLedger {
    name: String,
    state: Mutex<LedgerState>,
    appended: Notify,
    // Entries handed out and not yet dropped.
    outstanding: Arc<AtomicUsize>,
}

impl MemoryLedger {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(LedgerState {
                entries: BTreeMap::new(),
                current_ledger: 1,
                next_entry_id: 0,
                total_bytes: 0,
                terminated: false,
            }),
            appended: Notify::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends one entry. On a terminated log nothing is stored and the last
    /// position is returned; use [`MemoryLedger::try_append`] to observe that.
    pub fn append(&self, payload: impl Into<Bytes>, metadata: EntryMetadata) -> Position {
        self.try_append(payload, metadata)
            .unwrap_or_else(|| self.last_position().unwrap_or(Position::EARLIEST))
    }

    pub fn try_append(&self, payload: impl Into<Bytes>, metadata: EntryMetadata) -> Option<Position> {
        let payload = payload.into();
        let position = {
            let mut state = self.state.lock();
            if state.terminated {
                return None;
            }
            let position = Position::new(state.current_ledger, state.next_entry_id);
            state.next_entry_id += 1;
            state.total_bytes += payload.len() as u64;
            state
                .entries
                .insert(position, StoredEntry { payload, metadata });
            position
        };
        // Wake parked reads only after the entry is visible.
        self.appended.notify_waiters();
        Some(position)
    }

    /// Closes the current ledger; later appends land in a new ledger id.
    pub fn roll_ledger(&self) {
        let mut state = self.state.lock();
        state.current_ledger += 1;
        state.next_entry_id = 0;
    }

    pub fn terminate(&self) {
        self.state.lock().terminated = true;
        self.appended.notify_waiters();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn last_position(&self) -> Option<Position> {
        self.state
            .lock()
            .entries
            .keys()
            .next_back()
            .copied()
    }

    pub fn outstanding_entries(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn open_cursor(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryCursor> {
        Arc::new(MemoryCursor {
            name: name.into(),
            ledger: Arc::clone(self),
            state: Mutex::new(CursorState::default()),
            cancelled: Notify::new(),
        })
    }

    fn lease(&self) -> EntryLease {
        EntryLease::new(Arc::clone(&self.outstanding))
    }
}

#[derive(Debug)]
struct CursorState {
    read_position: Position,
    mark_delete: Option<Position>,
    individually_deleted: BTreeSet<Position>,
    // Injected failures, consumed one per read/replay.
    failing_reads: VecDeque<CursorError>,
    failing_replays: VecDeque<CursorError>,
    last_checked_read_position: Option<Position>,
    active: bool,
    persistable: bool,
    closed: bool,
    // A read is parked waiting for appends.
    waiting: bool,
    reads_issued: u64,
    replays_issued: u64,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            read_position: Position::EARLIEST,
            mark_delete: None,
            individually_deleted: BTreeSet::new(),
            failing_reads: VecDeque::new(),
            failing_replays: VecDeque::new(),
            last_checked_read_position: None,
            active: true,
            persistable: true,
            closed: false,
            waiting: false,
            reads_issued: 0,
            replays_issued: 0,
        }
    }
}

impl CursorState {
    fn is_deleted(&self, position: Position) -> bool {
        self.mark_delete.is_some_and(|md| position <= md)
            || self.individually_deleted.contains(&position)
    }
}

/// Cursor over a [`MemoryLedger`].
#[derive(Debug)]
pub struct MemoryCursor {
    name: String,
    ledger: Arc<MemoryLedger>,
    state: Mutex<CursorState>,
    cancelled: Notify,
}

impl MemoryCursor {
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// Individually acknowledges positions and advances mark-delete across the
    /// contiguous acknowledged prefix.
    pub fn acknowledge(&self, positions: &[Position]) {
        let mut state = self.state.lock();
        for position in positions {
            if !state.is_deleted(*position) {
                state.individually_deleted.insert(*position);
            }
        }
        let ledger = self.ledger.state.lock();
        loop {
            let next = match state.mark_delete {
                Some(md) => ledger
                    .entries
                    .range((Bound::Excluded(md), Bound::Unbounded))
                    .next()
                    .map(|(position, _)| *position),
                None => ledger.entries.keys().next().copied(),
            };
            match next {
                Some(position) if state.individually_deleted.remove(&position) => {
                    state.mark_delete = Some(position);
                }
                _ => break,
            }
        }
    }

    /// Cumulative acknowledgement of everything up to and including `position`.
    pub fn acknowledge_up_to(&self, position: Position) {
        let mut state = self.state.lock();
        if state.mark_delete.is_some_and(|md| md >= position) {
            return;
        }
        state.mark_delete = Some(position);
        state.individually_deleted = state.individually_deleted.split_off(&position.next());
        if state.read_position <= position {
            state.read_position = position.next();
        }
    }

    pub fn fail_next_read(&self, err: CursorError) {
        self.state.lock().failing_reads.push_back(err);
    }

    pub fn fail_next_replay(&self, err: CursorError) {
        self.state.lock().failing_replays.push_back(err);
    }

    pub fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    pub fn set_data_fully_persistable(&self, persistable: bool) {
        self.state.lock().persistable = persistable;
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cancelled.notify_waiters();
    }

    pub fn reads_issued(&self) -> u64 {
        self.state.lock().reads_issued
    }

    pub fn replays_issued(&self) -> u64 {
        self.state.lock().replays_issued
    }

    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    // Ok(None) means "caught up, park until something is appended".
    fn try_read(&self, request: &ReadRequest) -> CursorResult<Option<Vec<Entry>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CursorError::AlreadyClosed);
        }
        if let Some(err) = state.failing_reads.pop_front() {
            return Err(err);
        }
        let ledger = self.ledger.state.lock();
        let mut entries = Vec::new();
        let mut bytes = 0u64;
        let mut next_read = state.read_position;
        for (position, stored) in ledger.entries.range(state.read_position..) {
            if entries.len() >= request.max_entries
                || (!entries.is_empty() && bytes >= request.max_bytes)
            {
                break;
            }
            if request.max_position.is_some_and(|max| *position > max) {
                break;
            }
            next_read = position.next();
            if state.is_deleted(*position) {
                continue;
            }
            if request.skip.as_ref().is_some_and(|skip| skip(*position)) {
                continue;
            }
            bytes += stored.payload.len() as u64;
            entries.push(
                Entry::new(*position, stored.payload.clone(), stored.metadata.clone())
                    .with_lease(self.ledger.lease()),
            );
        }
        state.read_position = next_read;
        if !entries.is_empty() {
            state.reads_issued += 1;
            return Ok(Some(entries));
        }
        if ledger.terminated {
            return Err(CursorError::NoMoreEntries);
        }
        state.waiting = true;
        Ok(None)
    }

    fn replay_now(&self, mut positions: Vec<Position>, in_order: bool) -> CursorResult<Vec<Entry>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CursorError::AlreadyClosed);
        }
        if let Some(err) = state.failing_replays.pop_front() {
            return Err(err);
        }
        state.replays_issued += 1;
        if in_order {
            positions.sort_unstable();
            positions.dedup();
        }
        let ledger = self.ledger.state.lock();
        let mut entries = Vec::with_capacity(positions.len());
        for position in positions {
            if state.is_deleted(position) {
                continue;
            }
            // Entries built so far are dropped (and released) on the error return.
            let stored = ledger
                .entries
                .get(&position)
                .ok_or(CursorError::InvalidReplayPosition(position))?;
            entries.push(
                Entry::new(position, stored.payload.clone(), stored.metadata.clone())
                    .with_lease(self.ledger.lease()),
            );
        }
        Ok(entries)
    }
}

impl ManagedCursor for MemoryCursor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_entries_or_wait(&self, request: ReadRequest) -> BoxFuture<'_, CursorResult<Vec<Entry>>> {
        Box::pin(async move {
            loop {
                // Created before the check so an append racing with it still wakes us.
                let appended = self.ledger.appended.notified();
                let cancelled = self.cancelled.notified();
                tokio::pin!(appended);
                tokio::pin!(cancelled);
                if let Some(entries) = self.try_read(&request)? {
                    return Ok(entries);
                }
                tokio::select! {
                    _ = &mut appended => {
                        self.state.lock().waiting = false;
                    }
                    _ = &mut cancelled => {
                        let mut state = self.state.lock();
                        state.waiting = false;
                        return Err(if state.closed {
                            CursorError::AlreadyClosed
                        } else {
                            CursorError::Cancelled
                        });
                    }
                }
            }
        })
    }

    fn replay_entries(
        &self,
        positions: Vec<Position>,
        in_order: bool,
    ) -> BoxFuture<'_, CursorResult<Vec<Entry>>> {
        Box::pin(async move { self.replay_now(positions, in_order) })
    }

    fn acknowledged_positions(&self, positions: &[Position]) -> Vec<Position> {
        let state = self.state.lock();
        positions
            .iter()
            .copied()
            .filter(|position| state.is_deleted(*position))
            .collect()
    }

    fn mark_deleted_position(&self) -> Option<Position> {
        self.state.lock().mark_delete
    }

    fn read_position(&self) -> Position {
        self.state.lock().read_position
    }

    fn cancel_pending_read(&self) -> bool {
        let mut state = self.state.lock();
        if !state.waiting {
            return false;
        }
        state.waiting = false;
        drop(state);
        self.cancelled.notify_waiters();
        true
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn entries_in_backlog(&self) -> u64 {
        let state = self.state.lock();
        let ledger = self.ledger.state.lock();
        ledger
            .entries
            .keys()
            .filter(|position| !state.is_deleted(**position))
            .count() as u64
    }

    fn rewind(&self) {
        let mut state = self.state.lock();
        state.read_position = state
            .mark_delete
            .map(|md| md.next())
            .unwrap_or(Position::EARLIEST);
    }

    fn apply_max_size_cap(&self, max_entries: usize, max_bytes: u64) -> usize {
        if max_bytes == u64::MAX {
            return max_entries;
        }
        let ledger = self.ledger.state.lock();
        if ledger.entries.is_empty() {
            return max_entries;
        }
        let avg_entry_bytes = (ledger.total_bytes / ledger.entries.len() as u64).max(1);
        let cap = usize::try_from(max_bytes / avg_entry_bytes).unwrap_or(usize::MAX);
        max_entries.min(cap.max(1))
    }

    fn is_data_fully_persistable(&self) -> bool {
        self.state.lock().persistable
    }

    fn check_and_update_read_position_changed(&self) -> bool {
        let mut state = self.state.lock();
        let on_tail = {
            let ledger = self.ledger.state.lock();
            ledger.entries.range(state.read_position..).next().is_none()
        };
        let changed = state.last_checked_read_position != Some(state.read_position);
        state.last_checked_read_position = Some(state.read_position);
        on_tail || changed
    }
}
