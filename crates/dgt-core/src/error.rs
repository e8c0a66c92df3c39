//! Error types for the DGT core library.
//!
//! This module defines the error types shared by the worker-side communication
//! engine, providing structured error handling with detailed context.

use thiserror::Error;

use crate::kv::Key;

/// The main error type for DGT operations.
#[derive(Debug, Error)]
pub enum DgtError {
    /// A key-value batch violated a structural precondition.
    #[error("Invalid batch: {message}")]
    InvalidBatch {
        /// A description of the violated precondition.
        message: String,
    },

    /// Server key ranges are not contiguous.
    #[error("Non-contiguous server ranges after index {index}: [.., {end}) then [{begin}, ..)")]
    NonContiguousRanges {
        /// Index of the first range in the offending pair.
        index: usize,
        /// End of `ranges[index]`.
        end: Key,
        /// Begin of `ranges[index + 1]`.
        begin: Key,
    },

    /// The value buffer cannot be split evenly across keys.
    #[error("Value length {vals} is not a multiple of key count {keys}")]
    UnevenValueLength {
        /// Total number of value elements.
        vals: usize,
        /// Number of keys.
        keys: usize,
    },

    /// Error during configuration parsing or validation.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// A description of the configuration error.
        message: String,
    },

    /// A configuration variable required for DGT operation is missing.
    #[error("Missing required configuration: {name}")]
    MissingConfig {
        /// Name of the missing variable.
        name: &'static str,
    },

    /// The transport failed to deliver a message on the reliable channel.
    #[error("Transport error: {message}")]
    Transport {
        /// A description of the transport failure.
        message: String,
    },

    /// Pull-side reassembly detected missing or malformed server replies.
    #[error("Reassembly error: {message}")]
    Reassembly {
        /// A description of the coverage failure.
        message: String,
    },

    /// A timestamp is not known to the request tracker.
    #[error("Unknown request timestamp: {timestamp}")]
    UnknownTimestamp {
        /// The offending timestamp.
        timestamp: i32,
    },
}

/// A specialized Result type for DGT operations.
pub type Result<T> = std::result::Result<T, DgtError>;

impl DgtError {
    /// Convenience constructor for batch precondition failures.
    pub fn invalid_batch(message: impl Into<String>) -> Self {
        DgtError::InvalidBatch {
            message: message.into(),
        }
    }

    /// Convenience constructor for transport failures.
    pub fn transport(message: impl Into<String>) -> Self {
        DgtError::Transport {
            message: message.into(),
        }
    }
}
