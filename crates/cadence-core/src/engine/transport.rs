//! Transport state machine
//!
//! The transport lives in a single atomic word shared by the control and
//! render threads:
//!
//! ```text
//!  63  62 61        48 47                     0
//! [state][  seek tag  ][ position, nanoseconds ]
//! ```
//!
//! Control-side transitions rewrite the whole word and bump the seek tag.
//! The renderer advances the position with one compare-and-swap against the
//! word it read at the start of the block, so any control transition that
//! lands during a block wins and the renderer's advance is discarded.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::StopPolicy;
use crate::error::{EngineError, EngineResult};

const POSITION_BITS: u32 = 48;
const TAG_BITS: u32 = 14;
const POSITION_MASK: u64 = (1 << POSITION_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const STATE_SHIFT: u32 = POSITION_BITS + TAG_BITS;

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl TransportState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            _ => TransportState::Stopped,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
        }
    }
}

/// Point-in-time view of the transport
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    /// Song position in seconds
    pub position: f64,
    pub state: TransportState,
    pub tempo_multiplier: f64,
}

/// Convert seconds to the packed position, clamping to the representable range
#[inline]
fn to_nanos(seconds: f64) -> u64 {
    if !(seconds > 0.0) {
        return 0;
    }
    ((seconds * 1e9).round() as u64).min(POSITION_MASK)
}

#[inline]
fn to_seconds(nanos: u64) -> f64 {
    nanos as f64 * 1e-9
}

/// Decoded transport word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportWord(u64);

impl TransportWord {
    fn pack(state: TransportState, tag: u64, nanos: u64) -> Self {
        Self(((state as u64) << STATE_SHIFT) | ((tag & TAG_MASK) << POSITION_BITS) | (nanos & POSITION_MASK))
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_bits(self.0 >> STATE_SHIFT)
    }

    #[inline]
    fn tag(&self) -> u64 {
        (self.0 >> POSITION_BITS) & TAG_MASK
    }

    #[inline]
    fn nanos(&self) -> u64 {
        self.0 & POSITION_MASK
    }

    /// Position in seconds
    #[inline]
    pub fn position(&self) -> f64 {
        to_seconds(self.nanos())
    }

    /// Same state and tag at a new position; a control transition in between
    /// changes the tag, so a stale successor never matches
    fn moved_to(&self, seconds: f64, state: TransportState) -> Self {
        Self::pack(state, self.tag(), to_nanos(seconds))
    }

    /// Control-side rewrite: new state and position, next tag
    fn rewritten(&self, state: TransportState, nanos: u64) -> Self {
        Self::pack(state, self.tag().wrapping_add(1), nanos)
    }
}

/// Shared transport, owned jointly by controller and renderer
#[derive(Debug)]
pub struct TransportCell {
    word: AtomicU64,
}

impl Default for TransportCell {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCell {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(TransportWord::pack(TransportState::Stopped, 0, 0).0),
        }
    }

    #[inline]
    pub fn load(&self) -> TransportWord {
        TransportWord(self.word.load(Ordering::Acquire))
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        self.load().state()
    }

    #[inline]
    pub fn position(&self) -> f64 {
        self.load().position()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    fn transition(
        &self,
        action: &'static str,
        next: impl Fn(TransportWord) -> Option<TransportWord>,
    ) -> EngineResult<()> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                next(TransportWord(bits)).map(|w| w.0)
            })
            .map(|_| ())
            .map_err(|bits| EngineError::InvalidTransition {
                action,
                state: TransportWord(bits).state().name(),
            })
    }

    /// Start playing at `position` seconds from any state
    ///
    /// While already playing this relocates the playhead.
    pub fn play(&self, position: f64) {
        let nanos = to_nanos(position);
        let _ = self.transition("play", |w| Some(w.rewritten(TransportState::Playing, nanos)));
    }

    /// Playing → Paused, keeping the position
    pub fn pause(&self) -> EngineResult<()> {
        self.transition("pause", |w| {
            (w.state() == TransportState::Playing)
                .then(|| w.rewritten(TransportState::Paused, w.nanos()))
        })
    }

    /// Paused → Playing, keeping the position
    pub fn resume(&self) -> EngineResult<()> {
        self.transition("resume", |w| {
            (w.state() == TransportState::Paused)
                .then(|| w.rewritten(TransportState::Playing, w.nanos()))
        })
    }

    /// Any state → Stopped; the position follows `policy`
    pub fn stop(&self, policy: StopPolicy) {
        let _ = self.transition("stop", |w| {
            let nanos = match policy {
                StopPolicy::ResetToZero => 0,
                StopPolicy::RetainPosition => w.nanos(),
            };
            Some(w.rewritten(TransportState::Stopped, nanos))
        });
    }

    /// Move the playhead without changing state; the caller clamps
    pub fn set_position(&self, position: f64) {
        let nanos = to_nanos(position);
        let _ = self.transition("set position", |w| Some(w.rewritten(w.state(), nanos)));
    }

    /// Render-side advance from the word read at the start of the block
    ///
    /// Stops the transport when `finished`. Returns `false` if a control
    /// transition happened meanwhile; the control write then stands.
    #[inline]
    pub fn advance(&self, from: TransportWord, position: f64, finished: bool) -> bool {
        let state = if finished {
            TransportState::Stopped
        } else {
            from.state()
        };
        let next = from.moved_to(position, state);
        self.word
            .compare_exchange(from.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Clamp a requested position to `[0, duration]`
#[inline]
pub fn clamp_position(position: f64, duration: f64) -> f64 {
    if position.is_nan() {
        return 0.0;
    }
    position.clamp(0.0, duration.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        let t = TransportCell::new();
        assert_eq!(t.state(), TransportState::Stopped);
        assert!(matches!(
            t.pause(),
            Err(EngineError::InvalidTransition { action: "pause", state: "stopped" })
        ));
        assert!(t.resume().is_err());

        t.play(1.5);
        assert!(t.is_playing());
        assert!((t.position() - 1.5).abs() < 1e-9);

        t.pause().unwrap();
        assert_eq!(t.state(), TransportState::Paused);
        assert!((t.position() - 1.5).abs() < 1e-9);
        assert!(t.pause().is_err());

        t.resume().unwrap();
        assert!(t.is_playing());
        assert!((t.position() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_stop_policies() {
        let t = TransportCell::new();
        t.play(3.0);
        t.stop(StopPolicy::RetainPosition);
        assert_eq!(t.state(), TransportState::Stopped);
        assert!((t.position() - 3.0).abs() < 1e-9);

        t.play(3.0);
        t.stop(StopPolicy::ResetToZero);
        assert_eq!(t.position(), 0.0);
    }

    #[test]
    fn test_stop_twice_is_identical() {
        let t = TransportCell::new();
        t.play(2.0);
        t.stop(StopPolicy::ResetToZero);
        let first = (t.state(), t.position());
        t.stop(StopPolicy::ResetToZero);
        assert_eq!((t.state(), t.position()), first);
    }

    #[test]
    fn test_control_write_beats_render_advance() {
        let t = TransportCell::new();
        t.play(0.0);
        let block_start = t.load();
        // Control seeks to the same position while the block renders
        t.set_position(0.0);
        assert!(!t.advance(block_start, 0.01, false));
        assert_eq!(t.position(), 0.0);

        let block_start = t.load();
        assert!(t.advance(block_start, 0.01, false));
        assert!((t.position() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_advance_can_finish() {
        let t = TransportCell::new();
        t.play(9.99);
        let w = t.load();
        assert!(t.advance(w, 10.0, true));
        assert_eq!(t.state(), TransportState::Stopped);
        assert!((t.position() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_position() {
        assert_eq!(clamp_position(-1.0, 10.0), 0.0);
        assert_eq!(clamp_position(11.0, 10.0), 10.0);
        assert_eq!(clamp_position(f64::NAN, 10.0), 0.0);
        assert_eq!(clamp_position(5.0, 0.0), 0.0);
    }
}
