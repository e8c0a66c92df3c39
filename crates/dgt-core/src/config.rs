//! Worker configuration.
//!
//! All knobs of the deep-gradient-transmission scheme are environment-variable
//! driven so that a training launcher can flip them per node without a config
//! file. [`DgtConfig::from_env`] collects them once at worker construction;
//! the `with_*` setters exist for tests and embedders.
//!
//! | Variable | Effect |
//! |---|---|
//! | `DGT_CONTRI_ALPHA` | EMA weight for the contribution scorer, default 0.3 |
//! | `DGT_SET_RANDOM` | shuffle blocks instead of ranking by contribution |
//! | `DGT_INFO` | promote per-op drop-rate logs to info level |
//! | `DGT_ENABLE_BLOCK` | when 0, one block spans the whole payload |
//! | `DGT_BLOCK_SIZE` | block size in value elements |
//! | `ENABLE_DGT` | when 0, dispatch via the plain send on every channel |
//! | `CLEAR_ZERO` | drop zero-contribution non-terminal blocks |
//! | `DMLC_K` | initial drop rate (required when DGT is on) |
//! | `DMLC_K_MIN` | minimum drop rate (required when DGT is on) |
//! | `ADAPTIVE_K_FLAG` | adapt the drop rate to training loss (required) |
//! | `DMLC_UDP_CHANNEL_NUM` | number of lossy channels (required) |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DgtError, Result};

/// The drop-rate and channel parameters loaded on the first-push path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DgtParams {
    /// Initial drop rate `k`.
    pub k_init: f32,
    /// Lower bound on the adaptive drop rate.
    pub k_min: f32,
    /// Whether the drop rate tracks training loss.
    pub adaptive: bool,
    /// Number of lossy channels `C`; channel 0 is always reliable.
    pub channels: usize,
}

impl Default for DgtParams {
    fn default() -> Self {
        // Pre-initialization values: everything rides the reliable channel.
        Self {
            k_init: 1.0,
            k_min: 0.0,
            adaptive: false,
            channels: 0,
        }
    }
}

/// Static configuration of the worker send path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DgtConfig {
    /// EMA weight for the contribution scorer.
    pub contri_alpha: f32,
    /// Shuffle blocks uniformly instead of ranking by contribution.
    pub set_random: bool,
    /// Verbose per-op logging.
    pub info: bool,
    /// Whether payloads are fragmented at all.
    pub enable_block: bool,
    /// Block size in value elements; ignored when `enable_block` is false.
    pub block_size: usize,
    /// Steer blocks through the transport's DGT-aware classifier.
    pub enable_dgt: bool,
    /// Drop zero-contribution non-terminal blocks before ranking.
    pub clear_zero: bool,
    /// `DMLC_K`, present only when configured.
    pub k_init: Option<f32>,
    /// `DMLC_K_MIN`, present only when configured.
    pub k_min: Option<f32>,
    /// `ADAPTIVE_K_FLAG`, present only when configured.
    pub adaptive_k: Option<bool>,
    /// `DMLC_UDP_CHANNEL_NUM`, present only when configured.
    pub udp_channels: Option<usize>,
    /// Seed for the shuffle and classifier tie-break; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for DgtConfig {
    fn default() -> Self {
        Self {
            contri_alpha: 0.3,
            set_random: false,
            info: false,
            enable_block: false,
            block_size: 0,
            enable_dgt: false,
            clear_zero: false,
            k_init: None,
            k_min: None,
            adaptive_k: None,
            udp_channels: None,
            seed: None,
        }
    }
}

impl DgtConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            contri_alpha: env_parse("DGT_CONTRI_ALPHA")?.unwrap_or(0.3),
            set_random: env_flag("DGT_SET_RANDOM"),
            info: env_flag("DGT_INFO"),
            enable_block: env_flag("DGT_ENABLE_BLOCK"),
            block_size: env_parse("DGT_BLOCK_SIZE")?.unwrap_or(0),
            enable_dgt: env_flag("ENABLE_DGT"),
            clear_zero: env_flag("CLEAR_ZERO"),
            k_init: env_parse("DMLC_K")?,
            k_min: env_parse("DMLC_K_MIN")?,
            adaptive_k: env_parse::<i32>("ADAPTIVE_K_FLAG")?.map(|v| v != 0),
            udp_channels: env_parse("DMLC_UDP_CHANNEL_NUM")?,
            seed: None,
        })
    }

    /// Sets the EMA weight.
    pub fn with_contri_alpha(mut self, alpha: f32) -> Self {
        self.contri_alpha = alpha;
        self
    }

    /// Enables fragmentation with the given block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.enable_block = true;
        self.block_size = block_size;
        self
    }

    /// Enables DGT-aware dispatch.
    pub fn with_dgt(mut self, k_init: f32, k_min: f32, adaptive: bool, channels: usize) -> Self {
        self.enable_dgt = true;
        self.k_init = Some(k_init);
        self.k_min = Some(k_min);
        self.adaptive_k = Some(adaptive);
        self.udp_channels = Some(channels);
        self
    }

    /// Shuffles blocks instead of ranking them.
    pub fn with_set_random(mut self, set_random: bool) -> Self {
        self.set_random = set_random;
        self
    }

    /// Drops zero-contribution non-terminal blocks.
    pub fn with_clear_zero(mut self, clear_zero: bool) -> Self {
        self.clear_zero = clear_zero;
        self
    }

    /// Seeds the shuffle and classifier randomness.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Resolves the drop-rate parameters for the first-push initialization.
    ///
    /// When DGT dispatch is enabled every `DMLC_*` parameter must be present;
    /// a missing one is an unrecoverable configuration error. When DGT is
    /// disabled, unset parameters fall back to the pre-initialization
    /// defaults (everything reliable).
    pub fn dgt_params(&self) -> Result<DgtParams> {
        if self.enable_dgt {
            return Ok(DgtParams {
                k_init: self.k_init.ok_or(DgtError::MissingConfig { name: "DMLC_K" })?,
                k_min: self
                    .k_min
                    .ok_or(DgtError::MissingConfig { name: "DMLC_K_MIN" })?,
                adaptive: self.adaptive_k.ok_or(DgtError::MissingConfig {
                    name: "ADAPTIVE_K_FLAG",
                })?,
                channels: self.udp_channels.ok_or(DgtError::MissingConfig {
                    name: "DMLC_UDP_CHANNEL_NUM",
                })?,
            });
        }
        let defaults = DgtParams::default();
        Ok(DgtParams {
            k_init: self.k_init.unwrap_or(defaults.k_init),
            k_min: self.k_min.unwrap_or(defaults.k_min),
            adaptive: self.adaptive_k.unwrap_or(defaults.adaptive),
            channels: self.udp_channels.unwrap_or(defaults.channels),
        })
    }
}

/// Returns true when `name` is set to anything other than `0`.
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !v.trim().is_empty() && v.trim() != "0",
        Err(_) => false,
    }
}

/// Parses `name` when set; unset returns `Ok(None)`, unparseable is an error.
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<T>().map(Some).map_err(|_| DgtError::ConfigError {
            message: format!("cannot parse {name}={v}"),
        }),
        Err(_) => Ok(None),
    }
}
