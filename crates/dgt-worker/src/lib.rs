//! Worker-side deep-gradient-transmission engine.
//!
//! This crate implements the communication engine a training worker uses to
//! talk to parameter-server shards:
//!
//! - **Slicing**: one key-value batch is partitioned across server key
//!   ranges ([`slicer`]).
//! - **Fragmentation and steering**: each shard is cut into bounded blocks,
//!   scored by contribution ([`contribution`]), ranked, and spread across a
//!   reliable channel and several lossy ones ([`channel`]). The least
//!   important blocks may be dropped by the network; the drop fraction
//!   adapts to training progress ([`rate`]).
//! - **Request lifecycle**: timestamps, response counting, and completion
//!   callbacks ([`tracker`], [`worker`]).
//! - **Pull reassembly**: per-server reply fragments are collected, checked
//!   for coverage, and concatenated in key order ([`worker`]).
//!
//! The transport itself is injected behind the [`Transport`] trait; this
//! crate decides *what* to send on *which* channel, never *how*.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dgt_worker::KvWorker;
//!
//! let worker: KvWorker<f32> = KvWorker::new(0, 0, transport)?;
//! let ts = worker.push(vec![0, 1, 2], vec![0.0; 768])?;
//! worker.wait(ts)?;
//! ```

pub mod channel;
pub mod contribution;
pub mod message;
pub mod rate;
pub mod slicer;
pub mod tracker;
pub mod transport;
pub mod worker;

pub use channel::classify_channel;
pub use contribution::ContributionScorer;
pub use message::{Message, MessageMeta, MsgType};
pub use rate::{FileLossFeed, LossFeed, RateController};
pub use slicer::{default_slicer, default_slicer_fn, SlicedBatch, Slicer};
pub use tracker::RequestTracker;
pub use transport::{NodeId, Transport};
pub use worker::{Callback, KvWorker, SharedLens, SharedVals};
