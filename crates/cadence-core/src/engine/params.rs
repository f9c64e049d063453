//! Parameters shared between the control and render threads
//!
//! The control thread stores values into [`ParamCell`]s; the render thread
//! polls them once per block and compares against a [`ParameterTracker`] to
//! detect changes, which it then applies and reports as telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracker slot of the master gain
pub const SLOT_MASTER_GAIN: usize = 0;
/// Tracker slot of the tempo multiplier
pub const SLOT_TEMPO_MULTIPLIER: usize = 1;
/// First tracker slot used by node faders; node `i` uses `NODE_SLOT_BASE + i`
pub const NODE_SLOT_BASE: usize = 2;

const UNDO_BIT: u64 = 1 << 32;

/// Options attached to a parameter change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterChange {
    /// The change reverts an earlier one
    pub is_undo: bool,
    /// Ramp length in milliseconds; zero applies the value at the next block
    pub duration_ms: u32,
}

impl ParameterChange {
    fn encode(self) -> u64 {
        self.duration_ms as u64 | if self.is_undo { UNDO_BIT } else { 0 }
    }

    fn decode(bits: u64) -> Self {
        Self {
            is_undo: bits & UNDO_BIT != 0,
            duration_ms: bits as u32,
        }
    }
}

/// An `f64` parameter plus the options of its latest change
///
/// Options are stored before the value and loaded after it, so a reader that
/// sees a new value also sees options at least as new.
#[derive(Debug)]
pub struct ParamCell {
    value: AtomicU64,
    change: AtomicU64,
}

impl ParamCell {
    pub fn new(value: f64) -> Self {
        Self {
            value: AtomicU64::new(value.to_bits()),
            change: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Acquire))
    }

    #[inline]
    pub fn load_with_change(&self) -> (f64, ParameterChange) {
        let value = self.load();
        let change = ParameterChange::decode(self.change.load(Ordering::Acquire));
        (value, change)
    }

    pub fn store(&self, value: f64, change: ParameterChange) {
        self.change.store(change.encode(), Ordering::Release);
        self.value.store(value.to_bits(), Ordering::Release);
    }
}

/// Last value the render thread acted on, per parameter slot
///
/// Sized once for the largest graph, so tracking never allocates.
#[derive(Debug)]
pub struct ParameterTracker {
    previous: Box<[f64]>,
}

impl ParameterTracker {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            previous: vec![0.0; NODE_SLOT_BASE + max_nodes].into_boxed_slice(),
        }
    }

    /// Record `value` for `slot` without reporting a change
    #[inline]
    pub fn seed(&mut self, slot: usize, value: f64) {
        if let Some(prev) = self.previous.get_mut(slot) {
            *prev = value;
        }
    }

    /// Record `value`, returning the old value if it differs
    #[inline]
    pub fn observe(&mut self, slot: usize, value: f64) -> Option<f64> {
        let prev = self.previous.get_mut(slot)?;
        if prev.to_bits() == value.to_bits() {
            return None;
        }
        let old = *prev;
        *prev = value;
        Some(old)
    }
}
