// Positions waiting to be replayed to consumers, plus per-position redelivery counts.
use ahash::RandomState;
use felix_storage::Position;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;

/// How replay candidates are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeliveryMode {
    /// Any consumer may take any position; positions come out in ascending order.
    #[default]
    Ordered,
    /// Positions are bucketed by sticky key hash. Once a position of a hash is held
    /// back, later positions of that hash are held back too, while other hashes
    /// keep flowing.
    Keyed,
}

/// Ordered set of positions pending redelivery.
///
/// Adding a position that is already tracked is a no-op, so the size never double
/// counts. Positions at or below the mark-delete position are trimmed with
/// [`RedeliveryTracker::remove_all_up_to`].
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    mode: RedeliveryMode,
    positions: BTreeMap<Position, Option<u32>>,
    // Live positions per sticky hash.
    hash_refs: HashMap<u32, usize, RandomState>,
}

impl RedeliveryTracker {
    pub fn new(mode: RedeliveryMode) -> Self {
        Self {
            mode,
            positions: BTreeMap::new(),
            hash_refs: HashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn mode(&self) -> RedeliveryMode {
        self.mode
    }

    /// Returns true when the position was not tracked yet.
    pub fn add(&mut self, position: Position, sticky_key_hash: Option<u32>) -> bool {
        if self.positions.contains_key(&position) {
            return false;
        }
        self.positions.insert(position, sticky_key_hash);
        if let Some(hash) = sticky_key_hash {
            *self.hash_refs.entry(hash).or_insert(0) += 1;
        }
        true
    }

    pub fn remove(&mut self, position: Position) -> bool {
        match self.positions.remove(&position) {
            Some(hash) => {
                self.release_hash(hash);
                true
            }
            None => false,
        }
    }

    /// Drops every position `<= position`. Returns how many were dropped.
    pub fn remove_all_up_to(&mut self, position: Position) -> usize {
        let keep = self.positions.split_off(&position.next());
        let dropped = std::mem::replace(&mut self.positions, keep);
        let count = dropped.len();
        for hash in dropped.into_values() {
            self.release_hash(hash);
        }
        count
    }

    pub fn contains(&self, position: Position) -> bool {
        self.positions.contains_key(&position)
    }

    /// True while some pending position carries this sticky hash.
    pub fn contains_hash(&self, hash: u32) -> bool {
        self.hash_refs.contains_key(&hash)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn first_position(&self) -> Option<Position> {
        self.positions.keys().next().copied()
    }

    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        self.positions.keys().copied()
    }

    /// Up to `max` positions, ascending, that `filter` accepts. Nothing is removed.
    pub fn take_eligible<F>(&self, max: usize, mut filter: F) -> Vec<Position>
    where
        F: FnMut(Position, Option<u32>) -> bool,
    {
        let mut eligible = Vec::with_capacity(max.min(self.positions.len()));
        let mut held_hashes: HashSet<u32, RandomState> = HashSet::with_hasher(RandomState::new());
        for (position, hash) in &self.positions {
            if eligible.len() >= max {
                break;
            }
            if self.mode == RedeliveryMode::Keyed {
                if let Some(hash) = hash {
                    if held_hashes.contains(hash) {
                        continue;
                    }
                }
            }
            if filter(*position, *hash) {
                eligible.push(*position);
            } else if let (RedeliveryMode::Keyed, Some(hash)) = (self.mode, hash) {
                held_hashes.insert(*hash);
            }
        }
        eligible
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.hash_refs.clear();
    }

    fn release_hash(&mut self, hash: Option<u32>) {
        let Some(hash) = hash else {
            return;
        };
        if let Some(count) = self.hash_refs.get_mut(&hash) {
            *count -= 1;
            if *count == 0 {
                self.hash_refs.remove(&hash);
            }
        }
    }
}

/// How many times each position has been handed back for redelivery.
#[derive(Debug, Default)]
pub struct RedeliveryCounts {
    counts: BTreeMap<Position, u32>,
}

impl RedeliveryCounts {
    pub fn increment(&mut self, position: Position) -> u32 {
        let count = self.counts.entry(position).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn get(&self, position: Position) -> u32 {
        self.counts.get(&position).copied().unwrap_or(0)
    }

    pub fn remove(&mut self, position: Position) {
        self.counts.remove(&position);
    }

    pub fn remove_all_up_to(&mut self, position: Position) {
        self.counts = self.counts.split_off(&position.next());
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
