use crate::types::{Event, Mutation, Term};

use std::collections::VecDeque;

/// An entry in the in-flight buffer: a mutation together with the events its
/// commit will apply. The events are projected when the mutation enters the
/// buffer, so commit itself is pure bookkeeping and every replica projects
/// from identical state. `error` flags a zero-event outcome from a failed
/// topic program, reported to the client on commit.
#[derive(Clone, Debug, PartialEq)]
pub struct InFlightEntry {
    pub mutation: Mutation,
    pub events: Vec<Event>,
    pub error: bool,
}

/// The in-flight mutation buffer: a dense queue of uncommitted entries
/// addressed by global offset. The entry at logical position k has offset
/// base + k. Entries enter on leader acceptance or follower append, and
/// leave either on commit (advancing the base) or by being dropped from the
/// tail when a follower discovers a term conflict.
#[derive(Debug)]
pub struct InFlight {
    /// The offset of the entry at the head of the queue.
    base: u64,
    entries: VecDeque<InFlightEntry>,
}

impl InFlight {
    /// Creates an empty buffer whose first entry will have the given offset.
    pub fn new(base: u64) -> Self {
        assert!(base > 0, "offsets are 1-indexed");
        Self { base, entries: VecDeque::new() }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// The offset the next appended entry must have.
    pub fn next_offset(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry. The buffer is dense and term-ordered, so the entry
    /// must continue the sequence.
    pub fn append(&mut self, entry: InFlightEntry) {
        assert_eq!(entry.mutation.offset, self.next_offset(), "in-flight offset gap");
        if let Some(last) = self.entries.back() {
            assert!(entry.mutation.term >= last.mutation.term, "in-flight term regression");
        }
        self.entries.push_back(entry);
    }

    /// Returns the entry at the given offset, if buffered.
    pub fn get(&self, offset: u64) -> Option<&InFlightEntry> {
        if offset < self.base {
            return None;
        }
        self.entries.get((offset - self.base) as usize)
    }

    /// Returns the term of the entry at the given offset, if buffered.
    pub fn term_at(&self, offset: u64) -> Option<Term> {
        self.get(offset).map(|e| e.mutation.term)
    }

    /// Pops the committed head of the queue, advancing the base.
    pub fn pop_committed(&mut self) -> Option<InFlightEntry> {
        let entry = self.entries.pop_front()?;
        self.base += 1;
        Some(entry)
    }

    /// Drops all entries at and beyond the given offset, returning them in
    /// order. Committed entries have already left the buffer and can never
    /// be dropped this way.
    pub fn drop_tail_from(&mut self, offset: u64) -> Vec<InFlightEntry> {
        assert!(offset >= self.base, "cannot drop committed entries");
        let keep = (offset - self.base) as usize;
        if keep >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(keep).into()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InFlightEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, TopicName};
    use uuid::Uuid;

    fn entry(offset: u64, term: Term) -> InFlightEntry {
        InFlightEntry {
            mutation: Mutation {
                term,
                offset,
                topic: TopicName::new("t").unwrap(),
                client: Uuid::from_u128(1),
                nonce: offset,
                op: Operation::Put { key: vec![], value: vec![offset as u8] },
            },
            events: Vec::new(),
            error: false,
        }
    }

    #[test]
    fn append_get_pop() {
        let mut log = InFlight::new(1);
        assert_eq!(log.next_offset(), 1);
        log.append(entry(1, 1));
        log.append(entry(2, 1));
        log.append(entry(3, 2));
        assert_eq!(log.next_offset(), 4);
        assert_eq!(log.get(2), Some(&entry(2, 1)));
        assert_eq!(log.get(0), None);
        assert_eq!(log.get(4), None);
        assert_eq!(log.term_at(3), Some(2));

        assert_eq!(log.pop_committed(), Some(entry(1, 1)));
        assert_eq!(log.base(), 2);
        assert_eq!(log.get(1), None);
        assert_eq!(log.get(2), Some(&entry(2, 1)));
        assert_eq!(log.next_offset(), 4);
    }

    #[test]
    fn drop_tail() {
        let mut log = InFlight::new(1);
        for (offset, term) in [(1, 1), (2, 1), (3, 2), (4, 2)] {
            log.append(entry(offset, term));
        }
        assert_eq!(log.drop_tail_from(3), vec![entry(3, 2), entry(4, 2)]);
        assert_eq!(log.next_offset(), 3);
        assert_eq!(log.drop_tail_from(3), Vec::new());

        // The sequence continues from the drop point, possibly with a new term.
        log.append(entry(3, 3));
        assert_eq!(log.term_at(3), Some(3));
    }

    #[test]
    #[should_panic(expected = "offset gap")]
    fn append_gap_panics() {
        let mut log = InFlight::new(1);
        log.append(entry(2, 1));
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn append_term_regression_panics() {
        let mut log = InFlight::new(1);
        log.append(entry(1, 2));
        log.append(entry(2, 1));
    }
}
