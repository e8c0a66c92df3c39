//! Rank-to-channel classifier.
//!
//! Blocks ranked in the top `k` fraction of a batch ride the reliable
//! channel; the rest are spread evenly across the lossy lanes, with lower
//! ranks (higher contribution) landing on lower channel ids. The caller is
//! responsible for pinning the terminal block of a shard-op to channel 0
//! after classification.

use rand::Rng;

/// Maps a block's rank to a channel id.
///
/// `rank` is the block's position in the dispatch order (0 = highest
/// contribution) out of `num_ranked` blocks; `lossy_channels` is `C` and `k`
/// the drop rate. Returns 0 for the pinned top fraction, `1..=C` otherwise.
///
/// When the reliable fraction swallows the whole batch (`num_ranked ==
/// r_min`) there is no lossy span to interpolate into; a uniformly random
/// lossy channel is drawn instead.
pub fn classify_channel<R: Rng + ?Sized>(
    rank: usize,
    num_ranked: usize,
    lossy_channels: usize,
    k: f32,
    rng: &mut R,
) -> usize {
    if lossy_channels == 0 {
        return 0;
    }
    let r_min = (k * (num_ranked as f32 + 1.0)).round() as usize;
    if rank < r_min {
        return 0;
    }
    if num_ranked > r_min {
        1 + lossy_channels * (rank - r_min) / (num_ranked - r_min)
    } else {
        rng.gen_range(1..=lossy_channels)
    }
}
