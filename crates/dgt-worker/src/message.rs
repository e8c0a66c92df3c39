//! Wire messages exchanged with server shards.
//!
//! A [`Message`] is the meta block plus an ordered payload: keys, then
//! values, then optional lengths. The DGT fields (`first_key`, `seq`,
//! `seq_end`, `val_bytes`, `total_bytes`, `push_op_num`) form the block
//! addressing schema shared with the server-side reassembler; changing any
//! of them is a wire-contract change.

use dgt_core::{Key, SharedSlice};

/// Kind of an outbound worker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgType {
    /// Bootstrap push carrying a whole unfragmented shard.
    FirstPush = 1,
    /// One block of a fragmented push.
    BlockPush = 2,
    /// Pull request.
    PullRequest = 3,
}

/// Meta information attached to every message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMeta {
    /// Application id, matching the server app.
    pub app_id: i32,
    /// Locally unique customer id of the issuing worker.
    pub customer_id: i32,
    /// Request timestamp allocated by the tracker.
    pub timestamp: i32,
    /// Sender node id; filled by the transport.
    pub sender: i32,
    /// Receiver node id.
    pub recver: i32,
    /// Whether this message belongs to a push.
    pub push: bool,
    /// Whether this message belongs to a pull.
    pub pull: bool,
    /// Request (true) or response (false).
    pub request: bool,
    /// User command forwarded to the server handle.
    pub head: i32,
    /// Priority hint.
    pub priority: i32,
    /// Message kind.
    pub msg_type: MsgType,
    /// First key of the shard this block belongs to.
    pub first_key: Key,
    /// Block sequence number within the shard-op.
    pub seq: usize,
    /// First sequence number of the op (always 0).
    pub seq_begin: usize,
    /// Last sequence number of the op.
    pub seq_end: usize,
    /// Offset of this block's values inside the shard payload.
    pub val_bytes: usize,
    /// Total payload length of the shard-op.
    pub total_bytes: usize,
    /// Push-op counter at emission time.
    pub push_op_num: u64,
    /// Transport lane; 0 is reliable, `1..=C` are lossy.
    pub channel: usize,
    /// Length hint of the key chunk.
    pub keys_len: usize,
    /// Length hint of the value chunk.
    pub vals_len: usize,
    /// Length hint of the lens chunk.
    pub lens_len: usize,
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self {
            app_id: 0,
            customer_id: 0,
            timestamp: 0,
            sender: 0,
            recver: 0,
            push: false,
            pull: false,
            request: false,
            head: 0,
            priority: 0,
            msg_type: MsgType::FirstPush,
            first_key: 0,
            seq: 0,
            seq_begin: 0,
            seq_end: 0,
            val_bytes: 0,
            total_bytes: 0,
            push_op_num: 0,
            channel: 0,
            keys_len: 0,
            vals_len: 0,
            lens_len: 0,
        }
    }
}

/// One message: meta plus the keys/vals/lens payload chunks.
#[derive(Debug, Clone)]
pub struct Message<V> {
    /// Meta block.
    pub meta: MessageMeta,
    /// Key chunk.
    pub keys: SharedSlice<Key>,
    /// Value chunk.
    pub vals: SharedSlice<V>,
    /// Optional lens chunk.
    pub lens: Option<SharedSlice<usize>>,
    /// Contribution score; local to the worker, never serialized.
    pub contri: f32,
}

impl<V> Message<V> {
    /// Creates a message with empty payload chunks.
    pub fn new(meta: MessageMeta) -> Self {
        Self {
            meta,
            keys: SharedSlice::empty(),
            vals: SharedSlice::empty(),
            lens: None,
            contri: 0.0,
        }
    }

    /// Attaches the payload chunks and records their length hints.
    pub fn with_payload(
        mut self,
        keys: SharedSlice<Key>,
        vals: SharedSlice<V>,
        lens: Option<SharedSlice<usize>>,
    ) -> Self {
        self.meta.keys_len = keys.len();
        self.meta.vals_len = vals.len();
        self.meta.lens_len = lens.as_ref().map_or(0, |l| l.len());
        self.keys = keys;
        self.vals = vals;
        self.lens = lens;
        self
    }

    /// True when this is the final block of its shard-op.
    pub fn is_terminal(&self) -> bool {
        self.meta.seq == self.meta.seq_end
    }
}
