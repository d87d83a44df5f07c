//! In-memory priority queue for pending jobs.
//!
//! Entries are kept in dispatch order:
//!
//! - strict priority: every `critical` entry precedes every `high` one, and so on
//! - FIFO within a class: insertion scans from the head and places the new
//!   entry immediately before the first entry of strictly lower rank
//!
//! Arrival order is the only tie-break. Deadlines do not influence placement.
//!
//! The queue is unbounded and never blocks. Backpressure, if any, belongs to
//! the layer that submits work.

use std::collections::VecDeque;

use super::job::Priority;

/// Priority-ordered buffer of pending items.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    entries: VecDeque<(Priority, T)>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Inserts an item at the tail of its priority bucket.
    ///
    /// Re-inserting a retried job through this method places it behind every
    /// peer of the same class that is already waiting.
    pub fn enqueue(&mut self, priority: Priority, item: T) {
        let position = self
            .entries
            .iter()
            .position(|(queued, _)| queued.rank() < priority.rank())
            .unwrap_or(self.entries.len());
        self.entries.insert(position, (priority, item));
    }

    /// Removes and returns the highest-priority, oldest item.
    ///
    /// Returns `None` when the queue is empty.
    pub fn dequeue_next(&mut self) -> Option<T> {
        self.entries.pop_front().map(|(_, item)| item)
    }

    /// Priority of the item that would be dequeued next.
    pub fn peek_priority(&self) -> Option<Priority> {
        self.entries.front().map(|(priority, _)| *priority)
    }

    /// Returns the number of pending items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns whether any pending item matches the predicate.
    pub fn contains<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.entries.iter().any(|(_, item)| predicate(item))
    }

    /// Removes every pending item, in dispatch order.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    /// Returns per-class queue depths.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for (priority, _) in &self.entries {
            match priority {
                Priority::Critical => stats.critical += 1,
                Priority::High => stats.high += 1,
                Priority::Medium => stats.medium += 1,
                Priority::Low => stats.low += 1,
            }
        }
        stats
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueStats {
    /// Returns the total number of pending items.
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    /// Depth of a single class.
    pub fn depth(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(queue: &mut PriorityQueue<&'static str>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.dequeue_next()).collect()
    }

    #[test]
    fn test_empty_queue() {
        let mut queue: PriorityQueue<u32> = PriorityQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue_next(), None);
        assert_eq!(queue.peek_priority(), None);
    }

    #[test]
    fn test_strict_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(Priority::Low, "low-1");
        queue.enqueue(Priority::Medium, "medium-1");
        queue.enqueue(Priority::Critical, "critical-1");
        queue.enqueue(Priority::Low, "low-2");
        queue.enqueue(Priority::High, "high-1");
        queue.enqueue(Priority::Critical, "critical-2");
        queue.enqueue(Priority::Medium, "medium-2");
        queue.enqueue(Priority::High, "high-2");

        assert_eq!(queue.peek_priority(), Some(Priority::Critical));
        assert_eq!(
            drain_all(&mut queue),
            vec![
                "critical-1",
                "critical-2",
                "high-1",
                "high-2",
                "medium-1",
                "medium-2",
                "low-1",
                "low-2",
            ]
        );
    }

    #[test]
    fn test_reinsertion_goes_to_tail_of_bucket() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(Priority::Medium, "peer-1");
        queue.enqueue(Priority::Medium, "peer-2");
        queue.enqueue(Priority::Low, "low");

        // A retried medium job lands behind its waiting peers but ahead of lower classes.
        queue.enqueue(Priority::Medium, "retried");

        assert_eq!(drain_all(&mut queue), vec!["peer-1", "peer-2", "retried", "low"]);
    }

    #[test]
    fn test_stats_and_drain() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(Priority::High, 1);
        queue.enqueue(Priority::High, 2);
        queue.enqueue(Priority::Low, 3);

        let stats = queue.stats();
        assert_eq!(stats.high, 2);
        assert_eq!(stats.low, 1);
        assert_eq!(stats.depth(Priority::Critical), 0);
        assert_eq!(stats.total(), 3);

        assert!(queue.contains(|item| *item == 3));
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }
}
