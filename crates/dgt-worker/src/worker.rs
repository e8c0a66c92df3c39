//! The worker-side communication engine.
//!
//! [`KvWorker`] pushes gradient batches to server shards and pulls refreshed
//! parameters back. The push path slices a batch per server, fragments each
//! shard into bounded blocks, scores every block's contribution, ranks the
//! blocks, and steers them across the transport channels: the top `k`
//! fraction (and always the terminal block) over the reliable channel 0, the
//! rest over the lossy lanes where the network may drop them.
//!
//! Requests are asynchronous: `push`/`pull`/`push_pull` return a timestamp
//! and [`KvWorker::wait`] blocks until every addressed server has responded.
//! The transport's receiver delivers inbound messages through
//! [`KvWorker::process`].
//!
//! Reassembly coverage failures on the pull side (a server shard that never
//! arrived) are unrecoverable wire-contract violations and panic with a
//! diagnostic.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use dgt_core::{
    find_range, DgtConfig, DgtParams, Key, KvBatch, Result, SharedSlice, Value,
};

use crate::channel::classify_channel;
use crate::contribution::ContributionScorer;
use crate::message::{Message, MessageMeta, MsgType};
use crate::rate::{FileLossFeed, LossFeed, RateController};
use crate::slicer::{default_slicer_fn, Slicer};
use crate::tracker::RequestTracker;
use crate::transport::Transport;

/// Completion callback for a push or pull.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Caller-owned output buffer for pulled values.
///
/// The buffer must stay untouched between issuing the pull and the
/// completion callback; the reassembler fills it in place.
pub type SharedVals<V> = Arc<Mutex<Vec<V>>>;

/// Caller-owned output buffer for pulled value lengths.
pub type SharedLens = Arc<Mutex<Vec<usize>>>;

/// Callback registry and pull accumulation buffers; one mutex guards both.
struct Registry<V> {
    callbacks: HashMap<i32, Callback>,
    recv_kvs: HashMap<i32, Vec<KvBatch<V>>>,
}

/// Mutable DGT state of the send path.
struct DgtState {
    push_op_num: u64,
    params: DgtParams,
    drop_rate: f32,
    scorer: ContributionScorer,
    rate: RateController,
    rng: StdRng,
}

struct Inner<V: Value> {
    app_id: i32,
    customer_id: i32,
    transport: Arc<dyn Transport<V>>,
    config: DgtConfig,
    tracker: RequestTracker,
    registry: Mutex<Registry<V>>,
    dgt: Mutex<DgtState>,
    slicer: RwLock<Slicer<V>>,
}

/// A worker node that pushes and pulls key-value pairs against server shards.
///
/// Cloning is cheap and clones share all state, so the transport receiver
/// can hold its own handle for [`KvWorker::process`].
pub struct KvWorker<V: Value> {
    inner: Arc<Inner<V>>,
}

impl<V: Value> Clone for KvWorker<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Value> KvWorker<V> {
    /// Creates a worker configured from the process environment.
    pub fn new(app_id: i32, customer_id: i32, transport: Arc<dyn Transport<V>>) -> Result<Self> {
        let config = DgtConfig::from_env()?;
        Ok(Self::with_config(app_id, customer_id, transport, config))
    }

    /// Creates a worker with an explicit configuration.
    pub fn with_config(
        app_id: i32,
        customer_id: i32,
        transport: Arc<dyn Transport<V>>,
        config: DgtConfig,
    ) -> Self {
        let feed = Box::new(FileLossFeed::for_node(transport.my_node_id()));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let dgt = DgtState {
            push_op_num: 0,
            params: DgtParams::default(),
            drop_rate: 1.0,
            scorer: ContributionScorer::new(config.contri_alpha),
            rate: RateController::new(feed),
            rng,
        };
        Self {
            inner: Arc::new(Inner {
                app_id,
                customer_id,
                transport,
                config,
                tracker: RequestTracker::new(),
                registry: Mutex::new(Registry {
                    callbacks: HashMap::new(),
                    recv_kvs: HashMap::new(),
                }),
                dgt: Mutex::new(dgt),
                slicer: RwLock::new(default_slicer_fn::<V>()),
            }),
        }
    }

    /// Replaces the loss feed driving the rate controller.
    pub fn with_loss_feed(self, feed: Box<dyn LossFeed>) -> Self {
        self.inner.dgt.lock().rate = RateController::new(feed);
        self
    }

    /// Installs a user-defined partition function.
    pub fn set_slicer(&self, slicer: Slicer<V>) {
        *self.inner.slicer.write() = slicer;
    }

    /// Pushes a key-value list to the servers maintaining its key ranges.
    ///
    /// Non-blocking; returns the request timestamp. Use [`KvWorker::wait`]
    /// or the callback of [`KvWorker::zpush`] to learn about completion.
    pub fn push(&self, keys: Vec<Key>, vals: Vec<V>) -> Result<i32> {
        self.zpush(KvBatch::new(keys, vals), 0, None)
    }

    /// Zero-copy push. The batch's buffers must stay unchanged until the
    /// request completes.
    pub fn zpush(&self, batch: KvBatch<V>, cmd: i32, cb: Option<Callback>) -> Result<i32> {
        batch.validate()?;
        let ts = self.new_request();
        if let Some(cb) = cb {
            self.inner.registry.lock().callbacks.insert(ts, cb);
        }
        self.send(ts, true, false, cmd, &batch)?;
        Ok(ts)
    }

    /// Pulls the values of `keys` into `vals`.
    ///
    /// Non-blocking; `vals` is filled (allocating when empty) before the
    /// request completes.
    pub fn pull(&self, keys: Vec<Key>, vals: SharedVals<V>) -> Result<i32> {
        self.zpull(SharedSlice::from(keys), vals, None, 0, None, 0)
    }

    /// Zero-copy pull with optional length output and completion callback.
    pub fn zpull(
        &self,
        keys: SharedSlice<Key>,
        vals: SharedVals<V>,
        lens: Option<SharedLens>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32> {
        let mut request = KvBatch::new(keys.clone(), Vec::new());
        request.priority = priority;
        request.validate()?;
        let ts = self.add_pull_callback(keys, vals, lens, cb);
        self.send(ts, false, true, cmd, &request)?;
        Ok(ts)
    }

    /// Pushes `vals` and pulls the refreshed values back into `outs`.
    pub fn push_pull(&self, keys: Vec<Key>, vals: Vec<V>, outs: SharedVals<V>) -> Result<i32> {
        self.zpush_pull(KvBatch::new(keys, vals), outs, None, 0, None)
    }

    /// Zero-copy combined push-pull.
    pub fn zpush_pull(
        &self,
        batch: KvBatch<V>,
        outs: SharedVals<V>,
        out_lens: Option<SharedLens>,
        cmd: i32,
        cb: Option<Callback>,
    ) -> Result<i32> {
        batch.validate()?;
        let ts = self.add_pull_callback(batch.keys.clone(), outs, out_lens, cb);
        self.send(ts, true, true, cmd, &batch)?;
        Ok(ts)
    }

    /// Blocks until the request behind `ts` has been answered by every
    /// addressed server.
    pub fn wait(&self, ts: i32) -> Result<()> {
        self.inner.tracker.wait(ts)
    }

    /// Number of responses received so far for `ts`.
    pub fn num_response(&self, ts: i32) -> Result<usize> {
        self.inner.tracker.num_response(ts)
    }

    /// Push-op counter; advances on every push whose shard starts at key 0.
    pub fn push_op_num(&self) -> u64 {
        self.inner.dgt.lock().push_op_num
    }

    /// Drop rate currently applied by the channel classifier.
    pub fn drop_rate(&self) -> f32 {
        self.inner.dgt.lock().drop_rate
    }

    /// Delivers one inbound message from the transport receiver.
    ///
    /// Pull replies are buffered for reassembly; every response is counted
    /// against its request, and the completion callback runs when the last
    /// one arrives.
    pub fn process(&self, msg: Message<V>) -> Result<()> {
        if msg.meta.request {
            return Ok(());
        }
        let ts = msg.meta.timestamp;
        if msg.meta.pull {
            let kvs = KvBatch {
                keys: msg.keys,
                vals: msg.vals,
                lens: msg.lens.unwrap_or_default(),
                priority: msg.meta.priority,
            };
            self.inner
                .registry
                .lock()
                .recv_kvs
                .entry(ts)
                .or_default()
                .push(kvs);
        }
        if self.inner.tracker.record_response(ts)? {
            self.run_callback(ts);
        }
        Ok(())
    }

    fn new_request(&self) -> i32 {
        let num_servers = self.inner.transport.server_key_ranges().len();
        self.inner.tracker.new_request(num_servers)
    }

    /// Registers the reassembly callback for a pull and allocates its
    /// timestamp.
    fn add_pull_callback(
        &self,
        keys: SharedSlice<Key>,
        vals: SharedVals<V>,
        lens: Option<SharedLens>,
        user_cb: Option<Callback>,
    ) -> i32 {
        let ts = self.new_request();
        let inner = Arc::clone(&self.inner);
        let cb: Callback = Box::new(move || {
            inner.assemble_pull(ts, &keys, &vals, lens.as_ref());
            if let Some(cb) = user_cb {
                cb();
            }
        });
        self.inner.registry.lock().callbacks.insert(ts, cb);
        ts
    }

    /// Takes the callback for `ts` out of the registry and runs it.
    ///
    /// The entry is removed under the lock and invoked outside it, so the
    /// callback can re-enter the worker and can never fire twice.
    fn run_callback(&self, ts: i32) {
        let cb = self.inner.registry.lock().callbacks.remove(&ts);
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Slices the batch and emits one request per non-empty shard.
    fn send(&self, ts: i32, push: bool, pull: bool, cmd: i32, batch: &KvBatch<V>) -> Result<()> {
        let ranges = self.inner.transport.server_key_ranges();
        let slicer: Slicer<V> = self.inner.slicer.read().clone();
        let sliced = slicer.as_ref()(batch, &ranges)?;

        // Credit skipped servers up front; an all-empty slice completes the
        // request before anything hits the wire.
        let skipped = sliced.iter().filter(|s| s.is_none()).count();
        if self.inner.tracker.add_response(ts, skipped)? {
            self.run_callback(ts);
        }

        for (rank, shard) in sliced.iter().enumerate() {
            let Some(shard) = shard else { continue };
            if push {
                self.send_push_shard(ts, pull, cmd, rank, shard)?;
            } else {
                self.send_pull_request(ts, cmd, rank, shard)?;
            }
        }
        Ok(())
    }

    fn base_meta(&self, ts: i32, push: bool, pull: bool, cmd: i32, rank: usize, priority: i32) -> MessageMeta {
        MessageMeta {
            app_id: self.inner.app_id,
            customer_id: self.inner.customer_id,
            timestamp: ts,
            sender: self.inner.transport.my_node_id(),
            recver: self.inner.transport.server_rank_to_id(rank),
            push,
            pull,
            request: true,
            head: cmd,
            priority,
            ..Default::default()
        }
    }

    fn send_pull_request(&self, ts: i32, cmd: i32, rank: usize, shard: &KvBatch<V>) -> Result<()> {
        let mut meta = self.base_meta(ts, false, true, cmd, rank, shard.priority);
        meta.msg_type = MsgType::PullRequest;
        meta.first_key = shard.keys.as_slice()[0];
        meta.total_bytes = shard.vals.len();
        let msg = Message::new(meta).with_payload(shard.keys.clone(), shard.vals.clone(), None);
        self.inner.transport.send(msg)
    }

    fn send_push_shard(
        &self,
        ts: i32,
        pull: bool,
        cmd: i32,
        rank: usize,
        shard: &KvBatch<V>,
    ) -> Result<()> {
        let mut dgt = self.inner.dgt.lock();

        // A shard starting at key 0 marks the step boundary.
        if shard.keys.as_slice().first() == Some(&0) {
            dgt.push_op_num += 1;
            if dgt.push_op_num > 1 {
                dgt.rate.refresh();
                dgt.drop_rate = dgt.rate.drop_rate(&dgt.params);
                if self.inner.config.info {
                    info!(
                        op = dgt.push_op_num,
                        k = dgt.drop_rate,
                        delta_l = dgt.rate.delta_l(),
                        "drop rate refreshed"
                    );
                } else {
                    debug!(op = dgt.push_op_num, k = dgt.drop_rate, "drop rate refreshed");
                }
            } else {
                dgt.params = self.inner.config.dgt_params()?;
                dgt.drop_rate = dgt.params.k_init;
                info!(
                    k_init = dgt.params.k_init,
                    k_min = dgt.params.k_min,
                    adaptive = dgt.params.adaptive,
                    channels = dgt.params.channels,
                    "deep gradient transmission initialized"
                );
            }
        }

        if dgt.push_op_num == 1 {
            self.send_first_push(ts, pull, cmd, rank, shard, &dgt)
        } else {
            self.send_block_push(ts, pull, cmd, rank, shard, &mut dgt)
        }
    }

    /// Bootstrap push: the whole shard in one reliable, unfragmented
    /// message.
    fn send_first_push(
        &self,
        ts: i32,
        pull: bool,
        cmd: i32,
        rank: usize,
        shard: &KvBatch<V>,
        dgt: &DgtState,
    ) -> Result<()> {
        let mut meta = self.base_meta(ts, true, pull, cmd, rank, shard.priority);
        meta.msg_type = MsgType::FirstPush;
        meta.first_key = shard.keys.as_slice()[0];
        meta.total_bytes = shard.vals.len();
        meta.push_op_num = dgt.push_op_num;
        let msg = Message::new(meta).with_payload(
            shard.keys.clone(),
            shard.vals.clone(),
            shard_lens(shard),
        );
        self.inner.transport.send(msg)
    }

    /// Fragments a shard into blocks, scores and ranks them, assigns
    /// channels, and dispatches.
    fn send_block_push(
        &self,
        ts: i32,
        pull: bool,
        cmd: i32,
        rank: usize,
        shard: &KvBatch<V>,
        dgt: &mut DgtState,
    ) -> Result<()> {
        let config = &self.inner.config;
        let total_bytes = shard.vals.len();
        if total_bytes == 0 {
            return Ok(());
        }
        let block_size = if config.enable_block && config.block_size > 0 {
            config.block_size
        } else {
            total_bytes
        };
        let seq_num = (total_bytes + block_size - 1) / block_size;
        let seq_end = seq_num - 1;
        let first_key = shard.keys.as_slice()[0];
        let lens = shard_lens(shard);

        let mut blocks: Vec<Message<V>> = Vec::with_capacity(seq_num);
        let mut val_bytes = 0usize;
        for seq in 0..seq_num {
            let len = block_size.min(total_bytes - val_bytes);
            let mut meta = self.base_meta(ts, true, pull, cmd, rank, shard.priority);
            meta.msg_type = MsgType::BlockPush;
            meta.push_op_num = dgt.push_op_num;
            meta.total_bytes = total_bytes;
            meta.val_bytes = val_bytes;
            meta.first_key = first_key;
            meta.seq = seq;
            meta.seq_end = seq_end;
            let mut msg = Message::new(meta).with_payload(
                shard.keys.clone(),
                shard.vals.segment(val_bytes, val_bytes + len),
                lens.clone(),
            );
            msg.contri = dgt.scorer.score(first_key, seq, seq_end, msg.vals.as_slice());
            if !config.clear_zero || msg.contri != 0.0 || msg.is_terminal() {
                blocks.push(msg);
            }
            val_bytes += len;
        }

        // The terminal block keeps the last slot; everything before it is
        // ranked by contribution (or shuffled when so configured).
        let num_blocks = blocks.len();
        if num_blocks > 1 {
            let ranked = &mut blocks[..num_blocks - 1];
            if config.set_random {
                ranked.shuffle(&mut dgt.rng);
            } else {
                ranked.sort_by(|a, b| {
                    b.contri.partial_cmp(&a.contri).unwrap_or(Ordering::Equal)
                });
            }
        }

        debug!(
            ts,
            rank,
            blocks = num_blocks,
            seq_end,
            k = dgt.drop_rate,
            "dispatching block push"
        );

        for (order, mut msg) in blocks.into_iter().enumerate() {
            let mut channel = classify_channel(
                order,
                num_blocks,
                dgt.params.channels,
                dgt.drop_rate,
                &mut dgt.rng,
            );
            if msg.is_terminal() {
                channel = 0;
            }
            msg.meta.channel = channel;
            let sent = if config.enable_dgt {
                self.inner.transport.classify(msg, channel, 0)
            } else {
                self.inner.transport.send_on(msg, channel, 0)
            };
            match sent {
                Ok(()) => {}
                // Loss on the lossy lanes is the contract; only the
                // reliable channel surfaces delivery failures.
                Err(e) if channel == 0 => return Err(e),
                Err(e) => debug!(channel, error = %e, "block dropped on lossy channel"),
            }
        }
        Ok(())
    }
}

impl<V: Value> Inner<V> {
    /// Reassembles the buffered pull replies for `ts` into the caller's
    /// output buffers.
    ///
    /// Panics when the replies do not cover the requested keys; that means a
    /// server shard went missing on the reliable channel and the parameter
    /// state is unrecoverable.
    fn assemble_pull(
        &self,
        ts: i32,
        keys: &SharedSlice<Key>,
        vals: &SharedVals<V>,
        lens: Option<&SharedLens>,
    ) {
        let mut entries = self
            .registry
            .lock()
            .recv_kvs
            .remove(&ts)
            .unwrap_or_default();
        let requested = keys.as_slice();

        let mut total_key = 0usize;
        let mut total_val = 0usize;
        for entry in &entries {
            let entry_keys = entry.keys.as_slice();
            let (first, last) = match (entry_keys.first(), entry_keys.last()) {
                (Some(&f), Some(&l)) => (f, l),
                _ => panic!("pull reassembly for ts {ts}: server reply with no keys"),
            };
            let (lo, hi) = find_range(requested, first, last + 1);
            assert!(
                hi - lo == entry_keys.len(),
                "pull reassembly for ts {ts}: reply keys [{first}, {last}] do not match a \
                 sub-range of the request"
            );
            if !entry.lens.is_empty() {
                assert!(
                    entry.lens.len() == entry_keys.len(),
                    "pull reassembly for ts {ts}: reply lens misaligned with keys"
                );
            }
            total_key += entry_keys.len();
            total_val += entry.vals.len();
        }
        assert!(
            total_key == requested.len(),
            "pull reassembly for ts {ts}: received {total_key} of {} keys; lost some servers?",
            requested.len()
        );

        entries.sort_by_key(|e| e.keys.as_slice().first().copied().unwrap_or(0));

        let mut out = vals.lock();
        if out.is_empty() {
            out.reserve(total_val);
            for entry in &entries {
                out.extend_from_slice(entry.vals.as_slice());
            }
        } else {
            assert!(
                out.len() == total_val,
                "pull reassembly for ts {ts}: output buffer holds {} values, replies carry \
                 {total_val}",
                out.len()
            );
            let mut offset = 0usize;
            for entry in &entries {
                let vals = entry.vals.as_slice();
                out[offset..offset + vals.len()].copy_from_slice(vals);
                offset += vals.len();
            }
        }
        drop(out);

        if let Some(lens_buf) = lens {
            let mut out_lens = lens_buf.lock();
            if out_lens.is_empty() {
                out_lens.reserve(requested.len());
                for entry in &entries {
                    out_lens.extend_from_slice(entry.lens.as_slice());
                }
            } else {
                assert!(
                    out_lens.len() == requested.len(),
                    "pull reassembly for ts {ts}: lens buffer misaligned with request"
                );
                let mut offset = 0usize;
                for entry in &entries {
                    let lens = entry.lens.as_slice();
                    out_lens[offset..offset + lens.len()].copy_from_slice(lens);
                    offset += lens.len();
                }
            }
        }
    }
}

fn shard_lens<V>(shard: &KvBatch<V>) -> Option<SharedSlice<usize>> {
    if shard.lens.is_empty() {
        None
    } else {
        Some(shard.lens.clone())
    }
}
