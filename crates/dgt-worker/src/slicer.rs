//! Key-range slicer.
//!
//! Partitions one [`KvBatch`] into per-server shards by binary-searching the
//! key list against the server key ranges. Shards are zero-copy segments of
//! the original batch.

use std::sync::Arc;

use dgt_core::{DgtError, KvBatch, Range, Result, Value};

/// Per-server slices of one batch; `None` marks a server with no keys.
pub type SlicedBatch<V> = Vec<Option<KvBatch<V>>>;

/// A swappable partition function.
pub type Slicer<V> =
    Arc<dyn Fn(&KvBatch<V>, &[Range]) -> Result<SlicedBatch<V>> + Send + Sync + 'static>;

/// Partitions `batch` by the contiguous server `ranges`.
///
/// Every produced shard shares the batch's buffers. Fails when the ranges
/// are not contiguous, when keys extend past the final range, or when a
/// fixed-width batch does not divide evenly.
pub fn default_slicer<V: Value>(batch: &KvBatch<V>, ranges: &[Range]) -> Result<SlicedBatch<V>> {
    let n = ranges.len();
    let keys = batch.keys.as_slice();

    // Locate the split positions of each range boundary in the key list.
    let mut pos = vec![0usize; n + 1];
    let mut searched = 0usize;
    for (i, range) in ranges.iter().enumerate() {
        if i == 0 {
            pos[0] = keys.partition_point(|&k| k < range.begin);
            searched = pos[0];
        } else if ranges[i - 1].end != range.begin {
            return Err(DgtError::NonContiguousRanges {
                index: i - 1,
                end: ranges[i - 1].end,
                begin: range.begin,
            });
        }
        let len = keys[searched..].partition_point(|&k| k < range.end);
        searched += len;
        pos[i + 1] = pos[i] + len;
    }
    if pos[n] != keys.len() {
        return Err(DgtError::invalid_batch(format!(
            "{} keys fall past the final server range",
            keys.len() - pos[n]
        )));
    }

    let mut sliced: SlicedBatch<V> = vec![None; n];
    if keys.is_empty() {
        return Ok(sliced);
    }

    let fixed_width = if batch.lens.is_empty() {
        Some(batch.value_width()?)
    } else {
        None
    };

    let mut val_begin = 0usize;
    for i in 0..n {
        if pos[i + 1] == pos[i] {
            continue;
        }
        let keys = batch.keys.segment(pos[i], pos[i + 1]);
        let shard = match fixed_width {
            Some(k) => KvBatch::new(keys, batch.vals.segment(pos[i] * k, pos[i + 1] * k)),
            None => {
                let lens = batch.lens.segment(pos[i], pos[i + 1]);
                let span: usize = lens.as_slice().iter().sum();
                let vals = batch.vals.segment(val_begin, val_begin + span);
                val_begin += span;
                KvBatch::with_lens(keys, vals, lens)
            }
        };
        sliced[i] = Some(shard.with_priority(batch.priority));
    }
    Ok(sliced)
}

/// Wraps [`default_slicer`] as a [`Slicer`] handle.
pub fn default_slicer_fn<V: Value>() -> Slicer<V> {
    Arc::new(|batch, ranges| default_slicer(batch, ranges))
}
