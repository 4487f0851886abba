//! Lamport's distributed mutual exclusion over TCP.
//!
//! A fixed set of nodes shares one critical section. Each node keeps a
//! logical clock and a replicated request queue ordered by
//! `(timestamp, node id)`; it enters when its own request heads the queue
//! and every peer has replied.
//!
//! - [`clock`] is the Lamport logical clock.
//! - [`queue`] and [`mutex`] hold the request queue and grant rule.
//! - [`message`] defines the wire message and its JSON line codec.
//! - [`transport`] sends one message per connection and restores per-link
//!   order on receipt.
//! - [`node`] runs the event loop and inbound dispatch for one node.
//! - [`workload`] draws random delays and events.
//! - [`metrics`] and [`audit`] write the per-node metrics log and the shared
//!   audit log; [`audit::verify`] checks a finished run.
//! - [`config`] loads the peer directory and timing settings.
//! - [`cli`] parses the command line for the binary.

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod message;
pub mod metrics;
pub mod mutex;
pub mod node;
pub mod queue;
pub mod transport;
pub mod workload;
