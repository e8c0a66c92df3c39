//! Adaptive drop-rate controller.
//!
//! The drop rate `k` is the fraction of top-ranked blocks pinned to the
//! reliable channel. The controller observes training progress through a
//! [`LossFeed`] — by default the leading float of `/tmp/loss<node-id>.csv`,
//! re-read from the start on every step — and shrinks `k` proportionally to
//! `rt_loss / first_loss`, floored at `k_min`. Any monotone scalar
//! observation of training progress is a conforming feed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use dgt_core::DgtParams;

use crate::transport::NodeId;

/// A scalar observation source for the rate controller.
pub trait LossFeed: Send {
    /// Returns the current training-loss reading; 0 when unavailable.
    fn read(&mut self) -> f32;
}

/// Loss feed backed by a CSV file written by the training loop.
///
/// Reads the leading float of the file and rewinds, so the trainer can
/// overwrite the file in place. A missing or unreadable file yields 0.
#[derive(Debug)]
pub struct FileLossFeed {
    path: PathBuf,
    file: Option<File>,
}

impl FileLossFeed {
    /// Creates a feed over an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Creates the conventional per-node feed, `/tmp/loss<node-id>.csv`.
    pub fn for_node(node_id: NodeId) -> Self {
        Self::new(format!("/tmp/loss{node_id}.csv"))
    }
}

impl LossFeed for FileLossFeed {
    fn read(&mut self) -> f32 {
        if self.file.is_none() {
            self.file = File::open(&self.path).ok();
        }
        let Some(file) = self.file.as_mut() else {
            return 0.0;
        };
        let mut buf = [0u8; 64];
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return 0.0,
        };
        if file.seek(SeekFrom::Start(0)).is_err() {
            // Re-open on the next read rather than consume the file forward.
            self.file = None;
        }
        parse_leading_f32(&buf[..n])
    }
}

/// Parses the leading float of a CSV line; garbage yields 0.
fn parse_leading_f32(bytes: &[u8]) -> f32 {
    let text = String::from_utf8_lossy(bytes);
    text.trim_start()
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .and_then(|tok| tok.parse::<f32>().ok())
        .unwrap_or(0.0)
}

/// Tracks loss observations and produces the adaptive drop rate.
pub struct RateController {
    feed: Box<dyn LossFeed>,
    pre_loss: f32,
    delta_l: f32,
    first_loss: f32,
    rt_loss: f32,
}

impl RateController {
    /// Creates a controller over `feed`.
    pub fn new(feed: Box<dyn LossFeed>) -> Self {
        Self {
            feed,
            pre_loss: 0.0,
            delta_l: 0.0,
            first_loss: 0.0,
            rt_loss: 0.0,
        }
    }

    /// Consumes one loss observation at a step boundary.
    pub fn refresh(&mut self) {
        let cur_loss = self.feed.read();
        self.delta_l = if self.pre_loss != 0.0 {
            self.pre_loss - cur_loss
        } else {
            1.0
        };
        self.pre_loss = cur_loss;
        self.rt_loss = cur_loss;
        if self.first_loss == 0.0 {
            self.first_loss = cur_loss;
        }
    }

    /// Current drop rate under `params`.
    ///
    /// Without a usable first observation the adaptive path cannot form the
    /// loss ratio and falls back to `k_init`.
    pub fn drop_rate(&self, params: &DgtParams) -> f32 {
        if params.adaptive && self.first_loss != 0.0 {
            (params.k_init * (self.rt_loss / self.first_loss)).max(params.k_min)
        } else {
            params.k_init
        }
    }

    /// Loss improvement observed at the last refresh.
    pub fn delta_l(&self) -> f32 {
        self.delta_l
    }

    /// Most recent loss observation.
    pub fn rt_loss(&self) -> f32 {
        self.rt_loss
    }

    /// First non-zero loss observation.
    pub fn first_loss(&self) -> f32 {
        self.first_loss
    }
}

impl std::fmt::Debug for RateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateController")
            .field("pre_loss", &self.pre_loss)
            .field("delta_l", &self.delta_l)
            .field("first_loss", &self.first_loss)
            .field("rt_loss", &self.rt_loss)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct SeqFeed(Vec<f32>, usize);

    impl LossFeed for SeqFeed {
        fn read(&mut self) -> f32 {
            let v = self.0.get(self.1).copied().unwrap_or(0.0);
            self.1 += 1;
            v
        }
    }

    fn params(adaptive: bool) -> DgtParams {
        DgtParams {
            k_init: 0.8,
            k_min: 0.2,
            adaptive,
            channels: 4,
        }
    }

    #[test]
    fn test_first_reading_delta() {
        let mut rc = RateController::new(Box::new(SeqFeed(vec![4.0, 3.0], 0)));
        rc.refresh();
        assert!((rc.delta_l() - 1.0).abs() < 1e-6);
        assert!((rc.first_loss() - 4.0).abs() < 1e-6);
        rc.refresh();
        assert!((rc.delta_l() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_rate_tracks_loss() {
        let mut rc = RateController::new(Box::new(SeqFeed(vec![4.0, 3.0, 2.0, 0.1], 0)));
        let p = params(true);

        rc.refresh();
        assert!((rc.drop_rate(&p) - 0.8).abs() < 1e-6);

        rc.refresh();
        assert!((rc.drop_rate(&p) - 0.8 * 0.75).abs() < 1e-6);

        rc.refresh();
        assert!((rc.drop_rate(&p) - 0.8 * 0.5).abs() < 1e-6);

        // Floored at k_min.
        rc.refresh();
        assert!((rc.drop_rate(&p) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_rate_monotone_under_nonincreasing_loss() {
        let losses = vec![5.0, 5.0, 4.0, 2.5, 1.0, 0.5];
        let mut rc = RateController::new(Box::new(SeqFeed(losses, 0)));
        let p = params(true);
        let mut prev = f32::INFINITY;
        for _ in 0..6 {
            rc.refresh();
            let k = rc.drop_rate(&p);
            assert!(k <= prev + 1e-6);
            assert!(k >= p.k_min - 1e-6);
            prev = k;
        }
    }

    #[test]
    fn test_non_adaptive_fixed() {
        let mut rc = RateController::new(Box::new(SeqFeed(vec![4.0, 1.0], 0)));
        let p = params(false);
        rc.refresh();
        rc.refresh();
        assert!((rc.drop_rate(&p) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_absent_feed_falls_back() {
        // All-zero readings: first_loss never forms, adaptive falls back.
        let mut rc = RateController::new(Box::new(SeqFeed(vec![], 0)));
        rc.refresh();
        assert!((rc.drop_rate(&params(true)) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_file_feed_reads_and_rewinds() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "2.75,step=12").unwrap();
        f.flush().unwrap();

        let mut feed = FileLossFeed::new(f.path());
        assert!((feed.read() - 2.75).abs() < 1e-6);
        // Rewound: a second read sees the same value.
        assert!((feed.read() - 2.75).abs() < 1e-6);
    }

    #[test]
    fn test_file_feed_missing_file() {
        let mut feed = FileLossFeed::new("/nonexistent/loss.csv");
        assert_eq!(feed.read(), 0.0);
    }

    #[test]
    fn test_parse_leading_float() {
        assert!((parse_leading_f32(b"1.5,foo") - 1.5).abs() < 1e-6);
        assert!((parse_leading_f32(b"  0.25\n") - 0.25).abs() < 1e-6);
        assert_eq!(parse_leading_f32(b"garbage"), 0.0);
        assert_eq!(parse_leading_f32(b""), 0.0);
    }
}
