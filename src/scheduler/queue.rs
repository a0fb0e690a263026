//! Priority queue of scheduled job runs
//!
//! Jobs wait in a min-heap keyed by due time, move to the ready heap once
//! due, and leave the ready heap highest priority first, earliest due first
//! among equals. Re-pushing or removing a job bumps its generation so stale
//! heap entries are skipped instead of searched for.

use super::job::{JobId, JobPriority};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    id: JobId,
    priority: JobPriority,
    due: Instant,
    seq: u64,
    generation: u64,
}

/// Ready order: priority, then earliest due, then insertion
#[derive(Debug, PartialEq, Eq)]
struct Ready(Entry);

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.due.cmp(&self.0.due))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed(Entry);

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.due.cmp(&other.0.due).then_with(|| self.0.seq.cmp(&other.0.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    /// Live generation per queued job
    generations: HashMap<JobId, u64>,
    next_generation: u64,
    seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run of `id` at `due`, replacing any run already queued
    pub fn push(&mut self, id: JobId, priority: JobPriority, due: Instant) {
        self.next_generation += 1;
        self.seq += 1;
        self.generations.insert(id, self.next_generation);
        self.delayed.push(Reverse(Delayed(Entry {
            id,
            priority,
            due,
            seq: self.seq,
            generation: self.next_generation,
        })));
    }

    pub fn remove(&mut self, id: &JobId) -> bool {
        self.generations.remove(id).is_some()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.generations.contains_key(id)
    }

    /// Queued jobs
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    fn is_live(&self, entry: &Entry) -> bool {
        self.generations.get(&entry.id) == Some(&entry.generation)
    }

    /// Take the best job due at `now`
    pub fn pop_ready(&mut self, now: Instant) -> Option<JobId> {
        while let Some(Reverse(Delayed(entry))) = self.delayed.peek() {
            if entry.due > now {
                break;
            }
            if let Some(Reverse(Delayed(entry))) = self.delayed.pop() {
                if self.is_live(&entry) {
                    self.ready.push(Ready(entry));
                }
            }
        }

        while let Some(Ready(entry)) = self.ready.pop() {
            if self.is_live(&entry) {
                self.generations.remove(&entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    /// When the next not-yet-due job becomes ready
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse(Delayed(entry))) = self.delayed.peek() {
            if self.is_live(entry) {
                return Some(entry.due);
            }
            self.delayed.pop();
        }
        None
    }

    pub fn clear(&mut self) -> Vec<JobId> {
        self.ready.clear();
        self.delayed.clear();
        self.generations.drain().map(|(id, _)| id).collect()
    }
}
