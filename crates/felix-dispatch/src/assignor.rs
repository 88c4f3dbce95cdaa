// Splits a read batch across consumers while keeping every part of a chunked
// message on a single consumer.
use ahash::RandomState;
use felix_storage::{ChunkInfo, Entry};
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;

use crate::consumer::{Consumer, ConsumerId};

#[derive(Debug)]
pub struct ConsumerAssignment {
    pub consumer: Arc<dyn Consumer>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Default)]
pub struct Assignment {
    // In first-assigned order.
    pub assigned: Vec<ConsumerAssignment>,
    // Entries nobody can take now, in read order. They go back to redelivery.
    pub unassigned: Vec<Entry>,
}

impl Assignment {
    fn push(&mut self, slots: &mut HashMap<ConsumerId, usize, RandomState>, consumer: &Arc<dyn Consumer>, entry: Entry) {
        let slot = *slots.entry(consumer.id()).or_insert_with(|| {
            self.assigned.push(ConsumerAssignment {
                consumer: Arc::clone(consumer),
                entries: Vec::new(),
            });
            self.assigned.len() - 1
        });
        self.assigned[slot].entries.push(entry);
    }
}

/// Remembers which consumer owns each in-flight chunked message across batches.
///
/// The first chunk of a message claims the consumer currently being served; the last
/// chunk releases the claim. Chunks whose owner is out of permits are deferred, and
/// so is every later chunk of the same message in the batch, which keeps chunk order.
#[derive(Debug, Default)]
pub struct ChunkAwareAssignor {
    uuid_to_consumer: HashMap<String, ConsumerId, RandomState>,
}

impl ChunkAwareAssignor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `entries` using permits as observed at the start of the call.
    ///
    /// `next_consumer` yields consumers in dispatch order (it may cycle) and
    /// `lookup` resolves the owner of an in-flight chunked message.
    pub fn assign<N, L>(
        &mut self,
        entries: Vec<Entry>,
        num_consumers: usize,
        mut next_consumer: N,
        lookup: L,
    ) -> Assignment
    where
        N: FnMut() -> Option<Arc<dyn Consumer>>,
        L: Fn(ConsumerId) -> Option<Arc<dyn Consumer>>,
    {
        let mut assignment = Assignment::default();
        let mut slots: HashMap<ConsumerId, usize, RandomState> = HashMap::with_hasher(RandomState::new());
        let mut permits: HashMap<ConsumerId, i64, RandomState> = HashMap::with_hasher(RandomState::new());
        let mut deferred: HashSet<String, RandomState> = HashSet::with_hasher(RandomState::new());

        let mut entries = entries.into_iter();
        let Some(mut current) = next_consumer() else {
            assignment.unassigned.extend(entries);
            return assignment;
        };
        let mut current_permits = *permits
            .entry(current.id())
            .or_insert_with(|| current.available_permits());

        while let Some(entry) = entries.next() {
            if current_permits <= 0 {
                permits.insert(current.id(), current_permits);
                let mut attempts = 0;
                while current_permits <= 0 && attempts < num_consumers {
                    attempts += 1;
                    let Some(candidate) = next_consumer() else {
                        break;
                    };
                    current_permits = *permits
                        .entry(candidate.id())
                        .or_insert_with(|| candidate.available_permits());
                    current = candidate;
                }
                if current_permits <= 0 {
                    assignment.unassigned.push(entry);
                    assignment.unassigned.extend(entries);
                    return assignment;
                }
            }

            let messages = i64::from(entry.num_messages());
            let Some(chunk) = entry.metadata().chunk.clone() else {
                assignment.push(&mut slots, &current, entry);
                current_permits -= messages;
                continue;
            };
            if deferred.contains(&chunk.uuid) {
                assignment.unassigned.push(entry);
                continue;
            }
            match self.owner_for_chunk(&chunk, &current, &mut permits, &lookup) {
                Some(owner) if owner.id() == current.id() => {
                    assignment.push(&mut slots, &owner, entry);
                    current_permits -= messages;
                }
                Some(owner) => {
                    if let Some(owner_permits) = permits.get_mut(&owner.id()) {
                        *owner_permits -= messages;
                    }
                    assignment.push(&mut slots, &owner, entry);
                }
                None => {
                    deferred.insert(chunk.uuid);
                    assignment.unassigned.push(entry);
                }
            }
        }
        assignment
    }

    fn owner_for_chunk<L>(
        &mut self,
        chunk: &ChunkInfo,
        current: &Arc<dyn Consumer>,
        permits: &mut HashMap<ConsumerId, i64, RandomState>,
        lookup: &L,
    ) -> Option<Arc<dyn Consumer>>
    where
        L: Fn(ConsumerId) -> Option<Arc<dyn Consumer>>,
    {
        let owner_id = match self.uuid_to_consumer.get(&chunk.uuid) {
            Some(id) => *id,
            None => {
                if !chunk.is_first() {
                    // Owner forgotten (detached). Let the current consumer finish it.
                    tracing::debug!(
                        uuid = %chunk.uuid,
                        chunk_id = chunk.chunk_id,
                        consumer = current.name(),
                        "orphan chunk reassigned"
                    );
                }
                current.id()
            }
        };
        let owner = if owner_id == current.id() {
            Arc::clone(current)
        } else {
            match lookup(owner_id) {
                Some(owner) if owner.is_connected() => {
                    let owner_permits = *permits
                        .entry(owner_id)
                        .or_insert_with(|| owner.available_permits());
                    if owner_permits <= 0 {
                        return None;
                    }
                    owner
                }
                _ => Arc::clone(current),
            }
        };
        if chunk.is_last() {
            self.uuid_to_consumer.remove(&chunk.uuid);
        } else {
            self.uuid_to_consumer.insert(chunk.uuid.clone(), owner.id());
        }
        Some(owner)
    }

    /// Forgets every in-flight message owned by a detached consumer.
    pub fn remove_consumer(&mut self, id: ConsumerId) {
        self.uuid_to_consumer.retain(|_, owner| *owner != id);
    }

    pub fn owner_of(&self, uuid: &str) -> Option<ConsumerId> {
        self.uuid_to_consumer.get(uuid).copied()
    }

    pub fn in_flight_messages(&self) -> usize {
        self.uuid_to_consumer.len()
    }

    pub fn clear(&mut self) {
        self.uuid_to_consumer.clear();
    }
}
