//! Contiguous Batches
//!
//! A [`Batch`] is the unit of both download and application: the half-open
//! range `(start, end]` of sequence IDs. A role's cursor moves from `start`
//! to `end` only when every ID in between has been fully processed.

use std::fmt;

use crate::sequence::SequenceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Batch {
    start: SequenceId,
    end: SequenceId,
}

impl Batch {
    /// Returns `None` for an empty range (`end <= start`).
    pub fn new(start: SequenceId, end: SequenceId) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// The next batch after `current`, bounded by `latest` and `max_size`.
    ///
    /// `None` means there is nothing new to process.
    pub fn after(current: SequenceId, latest: SequenceId, max_size: u64) -> Option<Self> {
        let end = latest.min(current.saturating_add(max_size.max(1)));
        Self::new(current, end)
    }

    /// Exclusive lower bound: the last ID already processed.
    pub fn start(&self) -> SequenceId {
        self.start
    }

    /// Inclusive upper bound.
    pub fn end(&self) -> SequenceId {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.start.distance_to(self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        id > self.start && id <= self.end
    }

    /// The IDs of the batch in increasing order.
    pub fn ids(&self) -> impl Iterator<Item = SequenceId> {
        let end = self.end;
        std::iter::successors(self.start.next(), |id| id.next()).take_while(move |id| *id <= end)
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}
