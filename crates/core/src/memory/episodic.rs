use std::collections::VecDeque;
use uuid::Uuid;

use crate::types::MemoryRecord;

/// Bounded FIFO of the most recent records of one conversation.
/// Pushing at capacity evicts the oldest record.
#[derive(Debug, Clone)]
pub struct EpisodicBuffer {
    entries: VecDeque<MemoryRecord>,
    capacity: usize,
}

impl EpisodicBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append `record`, returning the evicted record if the buffer was full.
    pub fn push(&mut self, record: MemoryRecord) -> Option<MemoryRecord> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(record);
        evicted
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MemoryRecord> {
        self.entries.iter()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(text: &str) -> MemoryRecord {
        MemoryRecord::new("c1", "kai", text)
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut buf = EpisodicBuffer::new(2);
        assert!(buf.push(rec("a")).is_none());
        assert!(buf.push(rec("b")).is_none());
        let evicted = buf.push(rec("c")).unwrap();
        assert_eq!(evicted.text, "a");
        let texts: Vec<_> = buf.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buf = EpisodicBuffer::new(3);
        for i in 0..10 {
            buf.push(rec(&i.to_string()));
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn contains_tracks_ids() {
        let mut buf = EpisodicBuffer::new(1);
        let a = rec("a");
        let id = a.id;
        buf.push(a);
        assert!(buf.contains(id));
        buf.push(rec("b"));
        assert!(!buf.contains(id));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut buf = EpisodicBuffer::new(0);
        buf.push(rec("a"));
        assert_eq!(buf.len(), 1);
    }
}
