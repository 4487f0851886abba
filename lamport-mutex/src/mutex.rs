//! Per-node state of Lamport's mutual-exclusion protocol.
//!
//! [`MutexCoordinator`] never sends anything. The node feeds it the protocol
//! messages addressed to it and asks it whether the critical section may be
//! entered. Granting needs two things at once:
//!
//! - the node's own request heads the local [`RequestQueue`], and
//! - every peer has replied to that request.

use crate::message::{Message, NodeId};
use crate::queue::{RequestEntry, RequestQueue};

#[derive(Debug)]
pub struct MutexCoordinator {
    id: NodeId,
    peer_count: usize,
    queue: RequestQueue,
    reply_count: usize,
    requesting: bool,
}

impl MutexCoordinator {
    /// Creates the coordinator for node `id` in a cluster with `peer_count`
    /// other members.
    pub fn new(id: NodeId, peer_count: usize) -> Self {
        Self {
            id,
            peer_count,
            queue: RequestQueue::new(),
            reply_count: 0,
            requesting: false,
        }
    }

    /// Starts a new request cycle for this node.
    pub fn begin_cycle(&mut self) {
        self.reply_count = 0;
        self.requesting = true;
    }

    /// Records a request, either from a peer or this node's own.
    pub fn queue_request(&mut self, msg: &Message) {
        self.queue.insert(msg.sender, msg.timestamp);
    }

    /// Drops the sender's request. Unknown senders are ignored.
    pub fn release_request(&mut self, msg: &Message) {
        self.queue.remove(msg.sender);
    }

    pub fn reply_request(&mut self, _msg: &Message) {
        self.reply_count += 1;
    }

    /// Whether this node may enter the critical section now.
    pub fn request_crit_section(&self) -> bool {
        let own_head = self
            .queue
            .head()
            .is_some_and(|entry| entry.requester == self.id);
        own_head && self.reply_count == self.peer_count
    }

    /// Ends the current cycle after leaving the critical section.
    pub fn release_after_crit_section(&mut self) {
        self.queue.remove(self.id);
        self.reply_count = 0;
        self.requesting = false;
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    pub fn reply_count(&self) -> usize {
        self.reply_count
    }

    pub fn is_requesting(&self) -> bool {
        self.requesting
    }

    pub fn head(&self) -> Option<RequestEntry> {
        self.queue.head()
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn request(sender: NodeId, receiver: NodeId, timestamp: u64) -> Message {
        Message::new(sender, receiver, timestamp, MessageKind::Request)
    }

    fn reply(sender: NodeId, receiver: NodeId, timestamp: u64) -> Message {
        Message::new(sender, receiver, timestamp, MessageKind::Reply)
    }

    fn release(sender: NodeId, receiver: NodeId, timestamp: u64) -> Message {
        Message::new(sender, receiver, timestamp, MessageKind::Release)
    }

    #[test]
    fn test_grant_requires_full_quorum() {
        let mut mutex = MutexCoordinator::new(1, 2);
        assert_eq!((mutex.id(), mutex.peer_count()), (1, 2));
        mutex.begin_cycle();
        mutex.queue_request(&request(1, 1, 5));

        assert!(!mutex.request_crit_section(), "no replies yet");
        mutex.reply_request(&reply(2, 1, 7));
        assert!(!mutex.request_crit_section(), "one reply of two");
        mutex.reply_request(&reply(3, 1, 7));
        assert!(mutex.request_crit_section());
    }

    #[test]
    fn test_grant_requires_queue_head() {
        let mut mutex = MutexCoordinator::new(3, 2);
        mutex.begin_cycle();
        mutex.queue_request(&request(3, 3, 7));
        mutex.queue_request(&request(2, 3, 7));
        mutex.reply_request(&reply(1, 3, 8));
        mutex.reply_request(&reply(2, 3, 9));

        // (7, 2) orders before (7, 3)
        assert!(!mutex.request_crit_section());

        mutex.release_request(&release(2, 3, 12));
        assert!(mutex.request_crit_section());
    }

    #[test]
    fn test_release_after_crit_section_resets_cycle() {
        let mut mutex = MutexCoordinator::new(1, 1);
        mutex.begin_cycle();
        mutex.queue_request(&request(1, 1, 2));
        mutex.queue_request(&request(2, 1, 4));
        mutex.reply_request(&reply(2, 1, 5));
        assert!(mutex.request_crit_section());

        mutex.release_after_crit_section();
        assert_eq!(mutex.reply_count(), 0);
        assert!(!mutex.is_requesting());
        assert_eq!(mutex.head().map(|e| e.requester), Some(2));
        assert!(!mutex.request_crit_section());
    }

    #[test]
    fn test_release_without_request_is_tolerated() {
        let mut mutex = MutexCoordinator::new(1, 2);
        mutex.release_request(&release(3, 1, 4));
        assert!(mutex.queue().is_empty());
    }

    #[test]
    fn test_duplicate_request_does_not_duplicate_entry() {
        let mut mutex = MutexCoordinator::new(1, 2);
        mutex.queue_request(&request(2, 1, 3));
        mutex.queue_request(&request(2, 1, 3));
        assert_eq!(mutex.queue().len(), 1);
    }

    #[test]
    fn test_single_node_grants_on_own_request() {
        let mut mutex = MutexCoordinator::new(1, 0);
        mutex.begin_cycle();
        assert!(!mutex.request_crit_section(), "nothing queued yet");
        mutex.queue_request(&request(1, 1, 1));
        assert!(mutex.request_crit_section());
    }

    /// Three nodes, node 1 requests at timestamp 5 and the others reply.
    #[test]
    fn test_three_node_request_cycle() {
        let mut a = MutexCoordinator::new(1, 2);
        let mut b = MutexCoordinator::new(2, 2);
        let mut c = MutexCoordinator::new(3, 2);

        a.begin_cycle();
        a.queue_request(&request(1, 1, 5));
        b.queue_request(&request(1, 2, 5));
        c.queue_request(&request(1, 3, 5));

        a.reply_request(&reply(2, 1, 7));
        a.reply_request(&reply(3, 1, 7));
        assert!(a.request_crit_section());
        assert!(!b.request_crit_section());
        assert!(!c.request_crit_section());

        a.release_after_crit_section();
        b.release_request(&release(1, 2, 9));
        c.release_request(&release(1, 3, 9));
        assert!(a.queue().is_empty());
        assert!(b.queue().is_empty());
        assert!(c.queue().is_empty());
    }
}
