//! Shared audio primitives
//!
//! Stereo frames, gain helpers and the offline capture buffer. Everything on
//! the render path works on `[StereoSample]` slices and never allocates.

use std::ops::{AddAssign, Mul, MulAssign};

/// Sample rate used until the host calls `prepare()`
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Host block size assumed before `prepare()`
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Frames rendered per graph pass
///
/// Larger host blocks are split so node buffers keep a fixed size.
pub const DEFAULT_MAX_BLOCK_FRAMES: usize = 4096;

/// Quietest fader level accepted, in dB; anything at or below is silence
pub const MIN_GAIN_DB: f64 = -144.0;
/// Loudest fader level accepted, in dB
pub const MAX_GAIN_DB: f64 = 24.0;

pub type Sample = f32;

/// One stereo frame laid out as `[left, right]`
///
/// `#[repr(C)]` plus `Pod` lets a frame slice be viewed as interleaved `f32`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Same value on both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self::new(value, value)
    }

    /// Largest absolute value of the two channels
    #[inline]
    pub fn peak(&self) -> Sample {
        f32::max(self.left.abs(), self.right.abs())
    }
}

impl AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = Self::new(self.left + rhs.left, self.right + rhs.right);
    }
}

impl Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, gain: Sample) -> Self {
        Self::new(self.left * gain, self.right * gain)
    }
}

impl MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, gain: Sample) {
        *self = *self * gain;
    }
}

/// Accumulate `src` scaled by `gain` into `dst`
///
/// Stops at the shorter of the two slices.
#[inline]
pub fn mix_into(dst: &mut [StereoSample], src: &[StereoSample], gain: Sample) {
    dst.iter_mut().zip(src).for_each(|(out, &input)| *out += input * gain);
}

/// Decibels to linear gain, with everything at -144 dB or below mapped to 0
#[inline]
pub fn db_to_gain(db: f64) -> f64 {
    if db > MIN_GAIN_DB {
        10.0_f64.powf(db / 20.0)
    } else {
        0.0
    }
}

/// Offline capture of rendered audio
///
/// Owns its frames, so it is only built outside the real-time thread.
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    frames: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Pair planar left and right channels into frames
    ///
    /// Extra samples on the longer channel are dropped.
    pub fn from_channels(left: &[Sample], right: &[Sample]) -> Self {
        let frames = left
            .iter()
            .zip(right)
            .map(|(&l, &r)| StereoSample::new(l, r))
            .collect();
        Self { frames }
    }

    pub fn frames(&self) -> usize {
        self.frames.len()
    }

    /// Interleaved `[L, R, L, R, ...]` view without copying
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.frames)
    }

    pub fn peak(&self) -> Sample {
        self.frames.iter().fold(0.0, |acc, frame| acc.max(frame.peak()))
    }
}
