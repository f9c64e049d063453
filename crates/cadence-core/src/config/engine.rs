//! Engine configuration
//!
//! Every capacity the render path relies on is fixed here, before any audio
//! runs: pool sizes, queue bounds, node limits. Nothing grows at runtime.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCK_FRAMES, DEFAULT_SAMPLE_RATE};

/// What `stop()` does with the playback position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopPolicy {
    /// Stopping rewinds to the start of the song
    #[default]
    ResetToZero,
    /// Stopping keeps the last position
    RetainPosition,
}

/// One size class of the render memory pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolClassConfig {
    /// Length of each block in stereo frames
    pub block_frames: usize,
    /// Number of blocks in this class
    pub blocks: usize,
}

/// Dropout prevention thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutConfig {
    /// Number of recent block costs kept for load statistics
    pub window: usize,
    /// Consecutive over-budget blocks before a reduce signal (k)
    pub reduce_after: usize,
    /// Consecutive ample blocks before a restore signal (m)
    /// Must differ from `reduce_after`.
    pub restore_after: usize,
    /// Cost / deadline ratio at or below which a block counts as ample
    pub ample_ratio: f64,
    /// Cost / deadline ratio above which a block counts as over budget
    pub over_budget_ratio: f64,
    /// Deepest load reduction level
    pub max_level: u8,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self {
            window: 32,
            reduce_after: 4,
            restore_after: 64,
            ample_ratio: 0.5,
            over_budget_ratio: 0.9,
            max_level: 4,
        }
    }
}

/// Configuration for the projection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial sample rate, overridden by `prepare()`
    pub sample_rate: u32,
    /// Expected host block size in frames, overridden by `prepare()`
    pub block_size: usize,
    /// Number of host output channels, overridden by `prepare()`
    pub channel_count: usize,
    /// Largest number of frames rendered in one graph pass
    pub max_block_frames: usize,
    /// Maximum number of graph nodes in a song
    pub max_nodes: usize,
    /// Voices each track may sound at once at full quality
    pub voices_per_track: usize,
    /// Position policy applied by `stop()`
    pub stop_policy: StopPolicy,
    /// Capacity of the render → control telemetry queue
    pub telemetry_capacity: usize,
    /// Capacity of the control → render command queue
    pub command_capacity: usize,
    /// Memory pool size classes
    pub pool: Vec<PoolClassConfig>,
    /// Dropout prevention thresholds
    pub dropout: DropoutConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            channel_count: 2,
            max_block_frames: DEFAULT_MAX_BLOCK_FRAMES,
            max_nodes: 256,
            voices_per_track: 32,
            stop_policy: StopPolicy::default(),
            telemetry_capacity: 1024,
            command_capacity: 4096,
            pool: vec![PoolClassConfig {
                block_frames: DEFAULT_MAX_BLOCK_FRAMES,
                blocks: 512,
            }],
            dropout: DropoutConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check that the configuration is internally consistent
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.sample_rate == 0 {
            return invalid("sample_rate must be positive".into());
        }
        if self.block_size == 0 || self.max_block_frames == 0 {
            return invalid("block sizes must be positive".into());
        }
        if self.channel_count == 0 {
            return invalid("channel_count must be positive".into());
        }
        if self.max_nodes == 0 || self.voices_per_track == 0 {
            return invalid("max_nodes and voices_per_track must be positive".into());
        }
        if self.telemetry_capacity == 0 || self.command_capacity == 0 {
            return invalid("queue capacities must be positive".into());
        }
        if self.command_capacity < self.telemetry_capacity {
            return invalid(format!(
                "command_capacity ({}) must be at least telemetry_capacity ({})",
                self.command_capacity, self.telemetry_capacity
            ));
        }
        if !self.pool.iter().any(|c| c.block_frames >= self.max_block_frames && c.blocks > 0) {
            return invalid(format!(
                "pool needs a non-empty class of at least {} frames",
                self.max_block_frames
            ));
        }

        let d = &self.dropout;
        if d.window == 0 || d.reduce_after == 0 || d.restore_after == 0 {
            return invalid("dropout window and thresholds must be positive".into());
        }
        if d.reduce_after == d.restore_after {
            return invalid("dropout reduce_after and restore_after must differ".into());
        }
        if !(d.ample_ratio > 0.0 && d.ample_ratio < d.over_budget_ratio && d.over_budget_ratio <= 1.0) {
            return invalid(format!(
                "dropout ratios must satisfy 0 < ample ({}) < over_budget ({}) <= 1",
                d.ample_ratio, d.over_budget_ratio
            ));
        }
        Ok(())
    }

    /// Voice ceiling for a track at the given load level
    ///
    /// Each level halves the ceiling; never below one voice.
    pub fn voices_at_level(&self, level: u8) -> usize {
        (self.voices_per_track >> level.min(16)).max(1)
    }
}
