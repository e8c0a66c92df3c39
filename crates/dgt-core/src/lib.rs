//! Shared data model for the DGT worker-side communication engine.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - [`KvBatch`]: the key/value/length triple workers push and pull
//! - [`SharedSlice`]: refcounted zero-copy buffer views
//! - [`Range`]: half-open server key ranges
//! - [`DgtConfig`]: the environment-driven tuning surface
//! - [`DgtError`]: the common error type

pub mod config;
pub mod error;
pub mod kv;

pub use config::{DgtConfig, DgtParams};
pub use error::{DgtError, Result};
pub use kv::{find_range, Key, KvBatch, Range, SharedSlice, Value};
