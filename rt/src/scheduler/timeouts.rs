//! Coroutines suspended with a deadline.
use crate::coroutine::CoroutineId;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A point in time after which a blocking operation gives up.
///
/// A deadline either refers to an instant of the monotonic clock, or is
/// `Deadline::NEVER`, which compares greater than every other deadline.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never passes.
    pub const NEVER: Deadline = Deadline { at: None };

    pub fn at(instant: Instant) -> Self {
        Deadline { at: Some(instant) }
    }

    /// Returns a deadline `duration` from now.
    ///
    /// Durations too large to represent produce `Deadline::NEVER`.
    pub fn after(duration: Duration) -> Self {
        Deadline { at: Instant::now().checked_add(duration) }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_never(&self) -> bool {
        self.at.is_none()
    }

    /// Returns the time left until the deadline passes, or `None` for
    /// `Deadline::NEVER`.
    pub fn remaining_time(&self, now: Instant) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(now))
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::at(instant)
    }
}

impl From<Option<Instant>> for Deadline {
    fn from(instant: Option<Instant>) -> Self {
        Deadline { at: instant }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.at, other.at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// A single entry in the deadline heap.
#[derive(Copy, Clone, Debug)]
struct Timeout {
    at: Instant,
    id: CoroutineId,
}

/// A min-heap of coroutines ordered by the instant their deadline passes.
///
/// Unlike `BinaryHeap` this heap tracks the position of every coroutine, so a
/// coroutine whose wait completes before its deadline can be removed in
/// O(log n) instead of lingering until it expires.
pub(crate) struct DeadlineQueue {
    entries: Vec<Timeout>,

    /// The index into `entries` for every coroutine in the heap.
    positions: HashMap<CoroutineId, usize>,
}

impl DeadlineQueue {
    pub(crate) fn new() -> Self {
        DeadlineQueue { entries: Vec::new(), positions: HashMap::new() }
    }

    /// Schedules `id` to be woken up at `at`.
    ///
    /// A coroutine is in the queue at most once, so pushing a coroutine that's
    /// already present moves it to its new deadline.
    pub(crate) fn push(&mut self, id: CoroutineId, at: Instant) {
        self.remove(id);

        let index = self.entries.len();

        self.entries.push(Timeout { at, id });
        self.positions.insert(id, index);
        self.sift_up(index);
    }

    /// Returns the earliest deadline.
    pub(crate) fn peek(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.at)
    }

    /// Removes and returns the coroutine with the earliest deadline, if that
    /// deadline isn't later than `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<CoroutineId> {
        match self.peek() {
            Some(at) if at <= now => self.remove_at(0).map(|entry| entry.id),
            _ => None,
        }
    }

    /// Removes `id` from the queue, returning `true` if it was present.
    pub(crate) fn remove(&mut self, id: CoroutineId) -> bool {
        match self.positions.get(&id) {
            Some(&index) => self.remove_at(index).is_some(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: CoroutineId) -> bool {
        self.positions.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_at(&mut self, index: usize) -> Option<Timeout> {
        if index >= self.entries.len() {
            return None;
        }

        let last = self.entries.len() - 1;

        self.swap(index, last);

        let entry = self.entries.pop()?;

        self.positions.remove(&entry.id);

        if index < self.entries.len() {
            // The entry moved into the hole may belong either above or below
            // it, but only one of these calls actually moves it.
            self.sift_down(index);
            self.sift_up(index);
        }

        Some(entry)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;

            if self.entries[index].at >= self.entries[parent].at {
                break;
            }

            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();

        loop {
            let left = index * 2 + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.entries[left].at < self.entries[smallest].at
            {
                smallest = left;
            }

            if right < len
                && self.entries[right].at < self.entries[smallest].at
            {
                smallest = right;
            }

            if smallest == index {
                break;
            }

            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id, a);
        self.positions.insert(self.entries[b].id, b);
    }
}
