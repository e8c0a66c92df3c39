//! The transport seam.
//!
//! The engine never owns sockets. It consumes a [`Transport`] that knows how
//! to deliver a [`Message`] reliably, how to steer one across the lossy
//! lanes, and what the server topology looks like. Production wires this to
//! the real van; tests substitute a recording fake.

use dgt_core::{Range, Result};

use crate::message::Message;

/// Node identifier assigned by the topology service.
pub type NodeId = i32;

/// Delivery and topology interface consumed by the worker.
///
/// Channel 0 is reliable: delivery errors must be reported. Channels
/// `1..=C` are lossy by contract; implementations may drop messages on them
/// silently.
pub trait Transport<V>: Send + Sync {
    /// Delivers `msg` on the reliable channel.
    fn send(&self, msg: Message<V>) -> Result<()>;

    /// Delivers `msg` on `channel` without DGT classification; the channel
    /// is informational for the receiver.
    fn send_on(&self, msg: Message<V>, channel: usize, flags: u32) -> Result<()>;

    /// Hands `msg` to the DGT-aware classifier for dispatch on `channel`.
    fn classify(&self, msg: Message<V>, channel: usize, flags: u32) -> Result<()>;

    /// Ordered, contiguous key ranges of the server shards.
    fn server_key_ranges(&self) -> Vec<Range>;

    /// Maps a server rank to its node id.
    fn server_rank_to_id(&self, rank: usize) -> NodeId;

    /// Node id of this worker.
    fn my_node_id(&self) -> NodeId;
}
