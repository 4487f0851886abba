//! Pending critical-section requests in Lamport total order.

use std::collections::{BTreeSet, HashMap};

use crate::message::NodeId;

/// A queued request. Field order gives the derived `Ord` the protocol's total
/// order: timestamp first, requester id as the tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestEntry {
    pub timestamp: u64,
    pub requester: NodeId,
}

/// Ordered set of pending requests with at most one entry per requester.
///
/// Every node keeps its own copy. Since the order only depends on the
/// entries, nodes holding the same entries agree on the head.
#[derive(Debug, Default)]
pub struct RequestQueue {
    ordered: BTreeSet<RequestEntry>,
    by_requester: HashMap<NodeId, u64>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `requester`.
    pub fn insert(&mut self, requester: NodeId, timestamp: u64) {
        if let Some(previous) = self.by_requester.insert(requester, timestamp) {
            self.ordered.remove(&RequestEntry {
                timestamp: previous,
                requester,
            });
        }
        self.ordered.insert(RequestEntry {
            timestamp,
            requester,
        });
    }

    /// Removes the entry for `requester`, returning it if there was one.
    pub fn remove(&mut self, requester: NodeId) -> Option<RequestEntry> {
        let timestamp = self.by_requester.remove(&requester)?;
        let entry = RequestEntry {
            timestamp,
            requester,
        };
        self.ordered.remove(&entry);
        Some(entry)
    }

    pub fn head(&self) -> Option<RequestEntry> {
        self.ordered.first().copied()
    }

    pub fn get(&self, requester: NodeId) -> Option<RequestEntry> {
        self.by_requester
            .get(&requester)
            .map(|&timestamp| RequestEntry {
                timestamp,
                requester,
            })
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Entries in service order.
    pub fn iter(&self) -> impl Iterator<Item = &RequestEntry> {
        self.ordered.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_by_timestamp_then_requester() {
        let mut queue = RequestQueue::new();
        queue.insert(3, 7);
        queue.insert(2, 7);
        queue.insert(1, 9);
        queue.insert(4, 2);

        let order: Vec<(u64, NodeId)> = queue.iter().map(|e| (e.timestamp, e.requester)).collect();
        assert_eq!(order, vec![(2, 4), (7, 2), (7, 3), (9, 1)]);
    }

    #[test]
    fn test_tie_break_prefers_lower_requester() {
        let mut queue = RequestQueue::new();
        queue.insert(3, 7);
        queue.insert(2, 7);
        assert_eq!(
            queue.head(),
            Some(RequestEntry {
                timestamp: 7,
                requester: 2
            })
        );
    }

    #[test]
    fn test_head_is_independent_of_insertion_order() {
        let entries = [(5, 11), (1, 11), (4, 3), (2, 40)];

        let mut forward = RequestQueue::new();
        for &(requester, timestamp) in &entries {
            forward.insert(requester, timestamp);
        }
        let mut backward = RequestQueue::new();
        for &(requester, timestamp) in entries.iter().rev() {
            backward.insert(requester, timestamp);
        }

        assert_eq!(forward.head(), backward.head());
        assert_eq!(forward.head().map(|e| e.requester), Some(4));
        assert!(forward.iter().eq(backward.iter()));
    }

    #[test]
    fn test_reinsert_overwrites_instead_of_duplicating() {
        let mut queue = RequestQueue::new();
        queue.insert(1, 5);
        queue.insert(1, 12);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(1).map(|e| e.timestamp), Some(12));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut queue = RequestQueue::new();
        queue.insert(2, 3);
        assert!(queue.remove(9).is_none());
        assert_eq!(queue.len(), 1);

        assert!(queue.remove(2).is_some());
        assert!(queue.is_empty());
        assert!(queue.head().is_none());
    }
}
