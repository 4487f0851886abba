//! Lamport logical clock.
//!
//! Each node owns exactly one clock. The node lock serializes every call, so
//! the clock itself is a plain counter with no interior synchronization.

/// Scalar logical clock implementing Lamport's two update rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock {
    value: u64,
}

impl LogicalClock {
    /// Creates a clock starting at `seed`.
    pub fn new(seed: u64) -> Self {
        Self { value: seed }
    }

    /// Records a local event (send or internal step) and returns the new time.
    pub fn local_event(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Merges the timestamp carried by a received message.
    ///
    /// The clock jumps to `max(current, received) + 1`, so the receive event
    /// is ordered after both the local history and the send event.
    pub fn msg_event(&mut self, received: u64) -> u64 {
        self.value = self.value.max(received) + 1;
        self.value
    }

    /// Returns the current time without advancing it.
    pub fn peek(&self) -> u64 {
        self.value
    }
}
