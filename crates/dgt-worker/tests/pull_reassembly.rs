//! End-to-end tests of the pull path: request emission, out-of-order reply
//! reassembly, caller-supplied buffers, and coverage failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dgt_core::{DgtConfig, KvBatch, Range, SharedSlice};
use dgt_worker::message::{Message, MessageMeta, MsgType};
use dgt_worker::transport::{NodeId, Transport};
use dgt_worker::{KvWorker, SharedLens, SharedVals};

/// Recording transport for the pull tests.
struct MockTransport {
    ranges: Vec<Range>,
    sent: Mutex<Vec<Message<f32>>>,
}

impl MockTransport {
    fn new(ranges: Vec<Range>) -> Self {
        Self {
            ranges,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<Message<f32>> {
        self.sent.lock().clone()
    }
}

impl Transport<f32> for MockTransport {
    fn send(&self, msg: Message<f32>) -> dgt_core::Result<()> {
        self.sent.lock().push(msg);
        Ok(())
    }

    fn send_on(&self, msg: Message<f32>, _channel: usize, _flags: u32) -> dgt_core::Result<()> {
        self.sent.lock().push(msg);
        Ok(())
    }

    fn classify(&self, msg: Message<f32>, _channel: usize, _flags: u32) -> dgt_core::Result<()> {
        self.sent.lock().push(msg);
        Ok(())
    }

    fn server_key_ranges(&self) -> Vec<Range> {
        self.ranges.clone()
    }

    fn server_rank_to_id(&self, rank: usize) -> NodeId {
        8 + 2 * rank as NodeId
    }

    fn my_node_id(&self) -> NodeId {
        9
    }
}

fn two_servers() -> Vec<Range> {
    vec![Range::new(0, 4), Range::new(4, 8)]
}

fn worker(transport: Arc<MockTransport>) -> KvWorker<f32> {
    KvWorker::with_config(0, 0, transport, DgtConfig::default().with_seed(17))
}

/// Builds a pull reply carrying `keys`/`vals` for the given request.
fn reply(
    req: &Message<f32>,
    keys: Vec<u64>,
    vals: Vec<f32>,
    lens: Option<Vec<usize>>,
) -> Message<f32> {
    let meta = MessageMeta {
        app_id: req.meta.app_id,
        customer_id: req.meta.customer_id,
        timestamp: req.meta.timestamp,
        push: req.meta.push,
        pull: req.meta.pull,
        request: false,
        head: req.meta.head,
        ..Default::default()
    };
    Message::new(meta).with_payload(
        SharedSlice::from(keys),
        SharedSlice::from(vals),
        lens.map(SharedSlice::from),
    )
}

/// A response that carries no payload (server acked but lost the shard).
fn bare_ack(req: &Message<f32>) -> Message<f32> {
    Message::new(MessageMeta {
        timestamp: req.meta.timestamp,
        pull: false,
        request: false,
        ..Default::default()
    })
}

#[test]
fn pull_emits_one_request_per_server() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    let ts = w.pull(vec![1, 3, 5, 7], vals).unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    for msg in &sent {
        assert_eq!(msg.meta.msg_type, MsgType::PullRequest);
        assert!(msg.meta.pull);
        assert!(!msg.meta.push);
        assert!(msg.meta.request);
        assert_eq!(msg.meta.timestamp, ts);
        assert!(msg.vals.is_empty());
        assert_eq!(msg.meta.total_bytes, 0);
    }
    assert_eq!(sent[0].keys.as_slice(), &[1, 3]);
    assert_eq!(sent[1].keys.as_slice(), &[5, 7]);
}

#[test]
fn out_of_order_replies_reassemble_in_key_order() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    let fired = Arc::new(AtomicUsize::new(0));
    let cb_fired = Arc::clone(&fired);
    let ts = w
        .zpull(
            SharedSlice::from(vec![1u64, 3, 5, 7]),
            Arc::clone(&vals),
            None,
            0,
            Some(Box::new(move || {
                cb_fired.fetch_add(1, Ordering::SeqCst);
            })),
            0,
        )
        .unwrap();

    let sent = transport.sent();
    // Shard 1 answers first.
    w.process(reply(&sent[1], vec![5, 7], vec![5.0, 6.0, 7.0, 8.0], None))
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    w.process(reply(&sent[0], vec![1, 3], vec![1.0, 2.0, 3.0, 4.0], None))
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(
        vals.lock().as_slice(),
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
    );
    w.wait(ts).unwrap();
}

#[test]
fn caller_supplied_buffer_is_filled_in_place() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(vec![0.0; 4]));
    w.pull(vec![1, 5], Arc::clone(&vals)).unwrap();

    let sent = transport.sent();
    w.process(reply(&sent[0], vec![1], vec![0.5, 0.25], None))
        .unwrap();
    w.process(reply(&sent[1], vec![5], vec![2.0, 4.0], None))
        .unwrap();

    assert_eq!(vals.lock().as_slice(), &[0.5, 0.25, 2.0, 4.0]);
}

#[test]
fn variable_length_pull_fills_lens() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    let lens: SharedLens = Arc::new(Mutex::new(Vec::new()));
    w.zpull(
        SharedSlice::from(vec![1u64, 5]),
        Arc::clone(&vals),
        Some(Arc::clone(&lens)),
        0,
        None,
        0,
    )
    .unwrap();

    let sent = transport.sent();
    w.process(reply(&sent[1], vec![5], vec![9.0], Some(vec![1])))
        .unwrap();
    w.process(reply(&sent[0], vec![1], vec![1.0, 2.0, 3.0], Some(vec![3])))
        .unwrap();

    assert_eq!(vals.lock().as_slice(), &[1.0, 2.0, 3.0, 9.0]);
    assert_eq!(lens.lock().as_slice(), &[3, 1]);
}

#[test]
#[should_panic(expected = "lost some servers")]
fn missing_shard_is_fatal() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    w.pull(vec![1, 3, 5, 7], vals).unwrap();

    let sent = transport.sent();
    w.process(reply(&sent[0], vec![1, 3], vec![1.0, 2.0, 3.0, 4.0], None))
        .unwrap();
    // The second server acks without its shard: coverage fails.
    w.process(bare_ack(&sent[1])).unwrap();
}

#[test]
#[should_panic(expected = "sub-range")]
fn mismatched_reply_span_is_fatal() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    w.pull(vec![1, 3, 5, 7], vals).unwrap();

    let sent = transport.sent();
    w.process(reply(&sent[1], vec![5, 7], vec![0.0; 4], None))
        .unwrap();
    // Keys 2 and 3 straddle the requested [1, 3] span: key 2 was never asked
    // for, so the reply cannot be a sub-range of the request.
    w.process(reply(&sent[0], vec![2, 3], vec![0.0; 4], None))
        .unwrap();
}

#[test]
fn push_pull_round_trip() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let config = DgtConfig::default()
        .with_dgt(0.5, 0.0, false, 2)
        .with_seed(23);
    let w = KvWorker::with_config(0, 0, transport.clone(), config);

    let outs: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    let fired = Arc::new(AtomicUsize::new(0));
    let cb_fired = Arc::clone(&fired);
    let ts = w
        .zpush_pull(
            KvBatch::new(vec![0u64, 5], vec![1.0f32, 10.0]),
            Arc::clone(&outs),
            None,
            0,
            Some(Box::new(move || {
                cb_fired.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    // First op: one bootstrap message per shard, flagged push+pull.
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    for msg in &sent {
        assert_eq!(msg.meta.msg_type, MsgType::FirstPush);
        assert!(msg.meta.push);
        assert!(msg.meta.pull);
    }

    // Servers apply the update and echo the fresh values.
    w.process(reply(&sent[0], vec![0], vec![1.5], None)).unwrap();
    w.process(reply(&sent[1], vec![5], vec![10.5], None)).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(outs.lock().as_slice(), &[1.5, 10.5]);
    w.wait(ts).unwrap();
}

#[test]
fn concurrent_wait_wakes_on_completion() {
    let transport = Arc::new(MockTransport::new(two_servers()));
    let w = worker(transport.clone());

    let vals: SharedVals<f32> = Arc::new(Mutex::new(Vec::new()));
    let ts = w.pull(vec![1, 5], vals).unwrap();

    let waiter = {
        let w = w.clone();
        std::thread::spawn(move || w.wait(ts))
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!waiter.is_finished());

    let sent = transport.sent();
    w.process(reply(&sent[0], vec![1], vec![1.0], None)).unwrap();
    w.process(reply(&sent[1], vec![5], vec![2.0], None)).unwrap();
    waiter.join().unwrap().unwrap();
}
