//! Node processors
//!
//! The node set is closed: tracks, buses and outputs. Each variant implements
//! [`Processor`], and the renderer keeps one [`NodeProcessor`] per compiled
//! node, addressed by the node's index. Processors hold no heap data, so
//! rebuilding them for a new graph never allocates once the renderer's table
//! has its capacity.
//!
//! Synthesis is out of scope for the engine: tracks render a reference tone
//! per note so that routing, gain and voice limits are audible and testable.

use crate::song::Note;
use crate::types::{db_to_gain, StereoSample};

use super::{CompiledNode, NodeType};

/// Fader level in dB; the only parameter every node exposes
pub const PARAM_VOLUME_DB: usize = 0;

/// Linear attack of the reference tone, in seconds
const ATTACK_SECONDS: f64 = 0.005;
/// Linear release of the reference tone, in seconds
const RELEASE_SECONDS: f64 = 0.005;
/// Peak level of a full-velocity reference tone
const TONE_LEVEL: f32 = 0.2;

/// Per-block inputs shared by every processor
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext<'a> {
    /// Song time at the first frame of the block, in seconds
    pub window_start: f64,
    /// Song seconds advanced per rendered frame (tempo multiplier applied)
    pub seconds_per_frame: f64,
    /// Song seconds per real second; oscillators run in real time
    pub tempo_multiplier: f64,
    /// Whether the transport is advancing; stopped tracks stay silent
    pub playing: bool,
    /// Notes of the track being processed, sorted by start time
    pub notes: &'a [Note],
    /// Longest note duration on that track
    pub max_note_duration: f64,
    /// Most voices a track may sound in this block
    pub voice_limit: usize,
}

impl<'a> ProcessContext<'a> {
    /// Context for a block with no musical content
    pub fn silent() -> Self {
        Self {
            window_start: 0.0,
            seconds_per_frame: 0.0,
            tempo_multiplier: 1.0,
            playing: false,
            notes: &[],
            max_note_duration: 0.0,
            voice_limit: 0,
        }
    }

    /// Song time one past the last frame of a block of `frames`
    #[inline]
    pub fn window_end(&self, frames: usize) -> f64 {
        self.window_start + frames as f64 * self.seconds_per_frame
    }
}

/// Small capability set every node processor provides
pub trait Processor {
    /// Called before rendering at a new sample rate or block size
    fn prepare(&mut self, sample_rate: f64, max_frames: usize);

    /// Drop all transient state (ramps, voices)
    fn reset(&mut self);

    /// Render one block in place
    ///
    /// `buffer` arrives holding the node's summed inputs. `pre_fader`, when
    /// given, receives a copy of the signal before the fader stage. Returns
    /// the number of voices that sounded.
    fn process(
        &mut self,
        ctx: &ProcessContext<'_>,
        buffer: &mut [StereoSample],
        pre_fader: Option<&mut [StereoSample]>,
    ) -> usize;

    fn parameter(&self, index: usize) -> f64;

    /// Set a parameter, ramping over `ramp_frames` where the parameter supports it
    fn set_parameter(&mut self, index: usize, value: f64, ramp_frames: usize);
}

/// Ramped gain stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainStage {
    db: f64,
    current: f32,
    target: f32,
    step: f32,
    remaining: usize,
}

impl GainStage {
    pub fn new(db: f64) -> Self {
        let gain = db_to_gain(db) as f32;
        Self {
            db,
            current: gain,
            target: gain,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Target level in dB
    #[inline]
    pub fn db(&self) -> f64 {
        self.db
    }

    /// Move to `db`, linearly over `ramp_frames` (immediately when zero)
    pub fn set_db(&mut self, db: f64, ramp_frames: usize) {
        self.db = db;
        self.target = db_to_gain(db) as f32;
        if ramp_frames == 0 {
            self.current = self.target;
            self.remaining = 0;
            self.step = 0.0;
        } else {
            self.step = (self.target - self.current) / ramp_frames as f32;
            self.remaining = ramp_frames;
        }
    }

    /// Jump to the target, cancelling any ramp
    pub fn settle(&mut self) {
        self.current = self.target;
        self.remaining = 0;
        self.step = 0.0;
    }

    pub fn apply(&mut self, buffer: &mut [StereoSample]) {
        let mut frames = buffer.iter_mut();
        while self.remaining > 0 {
            let Some(sample) = frames.next() else {
                return;
            };
            self.current += self.step;
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            }
            *sample *= self.current;
        }
        let gain = self.current;
        if gain == 1.0 {
            return;
        }
        for sample in frames {
            *sample *= gain;
        }
    }
}

/// Reference-tone voice renderer for a track
///
/// Stateless apart from the sample rate: every sample is computed from
/// absolute song time, so seeking and tempo changes never leave hanging
/// voices behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackVoices {
    sample_rate: f64,
}

impl TrackVoices {
    pub fn new(sample_rate: f64) -> Self {
        Self { sample_rate }
    }

    /// Frequency of a MIDI pitch in Hz
    #[inline]
    pub fn pitch_to_hz(pitch: u8) -> f64 {
        440.0 * 2f64.powf((pitch as f64 - 69.0) / 12.0)
    }

    /// Add up to `ctx.voice_limit` sounding notes into `buffer`
    ///
    /// When more notes overlap the block than the limit allows, the ones that
    /// started first keep sounding. Returns the number of voices rendered.
    pub fn render(&self, ctx: &ProcessContext<'_>, buffer: &mut [StereoSample]) -> usize {
        if !ctx.playing || ctx.voice_limit == 0 || ctx.notes.is_empty() || buffer.is_empty() {
            return 0;
        }
        let start = ctx.window_start;
        let end = ctx.window_end(buffer.len());
        // Notes are sorted by start; none starting before this bound can still sound
        let first = ctx
            .notes
            .partition_point(|n| n.time + ctx.max_note_duration <= start);
        let last = ctx.notes.partition_point(|n| n.time < end);

        let mut voices = 0;
        for note in &ctx.notes[first..last.max(first)] {
            if note.end() <= start {
                continue;
            }
            if voices == ctx.voice_limit {
                break;
            }
            voices += 1;
            self.render_note(note, ctx, buffer);
        }
        voices
    }

    fn render_note(&self, note: &Note, ctx: &ProcessContext<'_>, buffer: &mut [StereoSample]) {
        let hz = Self::pitch_to_hz(note.pitch);
        // Above Nyquist the tone would alias
        if hz >= self.sample_rate * 0.5 {
            return;
        }
        let phase_per_second = std::f64::consts::TAU * hz;
        let real_time_scale = if ctx.tempo_multiplier > 0.0 {
            1.0 / ctx.tempo_multiplier
        } else {
            1.0
        };
        let level = TONE_LEVEL * note.velocity.clamp(0.0, 1.0);
        for (frame, sample) in buffer.iter_mut().enumerate() {
            let local = ctx.window_start + frame as f64 * ctx.seconds_per_frame - note.time;
            if local < 0.0 || local >= note.duration {
                continue;
            }
            let envelope = (local / ATTACK_SECONDS)
                .min((note.duration - local) / RELEASE_SECONDS)
                .clamp(0.0, 1.0);
            let value = (phase_per_second * local * real_time_scale).sin() * envelope;
            *sample += StereoSample::mono(value as f32 * level);
        }
    }
}

/// A TRACK node: note voices followed by the track fader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackProcessor {
    voices: TrackVoices,
    fader: GainStage,
}

/// A BUS node: summed inputs through the bus fader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusProcessor {
    fader: GainStage,
}

/// An OUTPUT node: a final gain stage before the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputProcessor {
    fader: GainStage,
}

/// Closed set of node processors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeProcessor {
    Track(TrackProcessor),
    Bus(BusProcessor),
    Output(OutputProcessor),
}

impl NodeProcessor {
    /// Processor for a compiled node at fader level `volume_db`
    pub fn for_node(node: &CompiledNode, volume_db: f64, sample_rate: f64) -> Self {
        let fader = GainStage::new(volume_db);
        match node.kind {
            NodeType::Track => NodeProcessor::Track(TrackProcessor {
                voices: TrackVoices::new(sample_rate),
                fader,
            }),
            NodeType::Bus => NodeProcessor::Bus(BusProcessor { fader }),
            NodeType::Output => NodeProcessor::Output(OutputProcessor { fader }),
        }
    }

    fn fader_mut(&mut self) -> &mut GainStage {
        match self {
            NodeProcessor::Track(p) => &mut p.fader,
            NodeProcessor::Bus(p) => &mut p.fader,
            NodeProcessor::Output(p) => &mut p.fader,
        }
    }

    fn fader(&self) -> &GainStage {
        match self {
            NodeProcessor::Track(p) => &p.fader,
            NodeProcessor::Bus(p) => &p.fader,
            NodeProcessor::Output(p) => &p.fader,
        }
    }
}

impl Processor for NodeProcessor {
    fn prepare(&mut self, sample_rate: f64, _max_frames: usize) {
        if let NodeProcessor::Track(track) = self {
            track.voices = TrackVoices::new(sample_rate);
        }
        self.fader_mut().settle();
    }

    fn reset(&mut self) {
        self.fader_mut().settle();
    }

    fn process(
        &mut self,
        ctx: &ProcessContext<'_>,
        buffer: &mut [StereoSample],
        pre_fader: Option<&mut [StereoSample]>,
    ) -> usize {
        let voices = match self {
            NodeProcessor::Track(track) => track.voices.render(ctx, buffer),
            NodeProcessor::Bus(_) | NodeProcessor::Output(_) => 0,
        };
        if let Some(tap) = pre_fader {
            let n = tap.len().min(buffer.len());
            tap[..n].copy_from_slice(&buffer[..n]);
        }
        self.fader_mut().apply(buffer);
        voices
    }

    fn parameter(&self, index: usize) -> f64 {
        match index {
            PARAM_VOLUME_DB => self.fader().db(),
            _ => 0.0,
        }
    }

    fn set_parameter(&mut self, index: usize, value: f64, ramp_frames: usize) {
        if index == PARAM_VOLUME_DB {
            self.fader_mut().set_db(value, ramp_frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(time: f64, duration: f64) -> Note {
        Note {
            time,
            duration,
            pitch: 69,
            velocity: 1.0,
        }
    }

    fn ctx(notes: &[Note], start: f64, voice_limit: usize) -> ProcessContext<'_> {
        ProcessContext {
            window_start: start,
            seconds_per_frame: 1.0 / 48000.0,
            tempo_multiplier: 1.0,
            playing: true,
            notes,
            max_note_duration: notes.iter().map(|n| n.duration).fold(0.0, f64::max),
            voice_limit,
        }
    }

    fn track_node() -> CompiledNode {
        CompiledNode {
            id: "t".into(),
            name: "T".into(),
            kind: NodeType::Track,
            bus_type: None,
            volume_db: 0.0,
            inputs: Box::new([]),
            sends: Box::new([]),
            feeds_pre_fader: false,
        }
    }

    #[test]
    fn test_pitch_to_hz() {
        assert!((TrackVoices::pitch_to_hz(69) - 440.0).abs() < 1e-9);
        assert!((TrackVoices::pitch_to_hz(81) - 880.0).abs() < 1e-9);
    }

    #[test]
    fn test_voice_renders_only_inside_note() {
        let notes = [note(0.0, 0.5)];
        let voices = TrackVoices::new(48000.0);
        let mut buffer = [StereoSample::silence(); 512];

        assert_eq!(voices.render(&ctx(&notes, 0.0, 8), &mut buffer), 1);
        assert!(buffer.iter().any(|s| s.peak() > 0.0));

        let mut buffer = [StereoSample::silence(); 512];
        assert_eq!(voices.render(&ctx(&notes, 0.6, 8), &mut buffer), 0);
        assert!(buffer.iter().all(|s| s.peak() == 0.0));
    }

    #[test]
    fn test_voice_limit_keeps_earliest_notes() {
        let notes = [note(0.0, 1.0), note(0.1, 1.0), note(0.2, 1.0)];
        let voices = TrackVoices::new(48000.0);
        let mut buffer = [StereoSample::silence(); 256];
        assert_eq!(voices.render(&ctx(&notes, 0.5, 2), &mut buffer), 2);
        assert_eq!(voices.render(&ctx(&notes, 0.5, 8), &mut buffer), 3);
    }

    #[test]
    fn test_stopped_track_is_silent() {
        let notes = [note(0.0, 1.0)];
        let mut c = ctx(&notes, 0.0, 8);
        c.playing = false;
        let mut buffer = [StereoSample::silence(); 64];
        assert_eq!(TrackVoices::new(48000.0).render(&c, &mut buffer), 0);
    }

    #[test]
    fn test_gain_stage_ramps_to_target() {
        let mut stage = GainStage::new(0.0);
        stage.set_db(-200.0, 4);
        let mut buffer = [StereoSample::mono(1.0); 8];
        stage.apply(&mut buffer);
        assert!((buffer[0].left - 0.75).abs() < 1e-6);
        assert!((buffer[1].left - 0.5).abs() < 1e-6);
        assert_eq!(buffer[3].left, 0.0);
        assert_eq!(buffer[7].left, 0.0);
    }

    #[test]
    fn test_processor_pre_fader_tap_and_parameter() {
        let notes = [note(0.0, 1.0)];
        let mut processor = NodeProcessor::for_node(&track_node(), 0.0, 48000.0);
        processor.set_parameter(PARAM_VOLUME_DB, -200.0, 0);
        assert_eq!(processor.parameter(PARAM_VOLUME_DB), -200.0);

        let mut buffer = [StereoSample::silence(); 128];
        let mut tap = [StereoSample::silence(); 128];
        let voices = processor.process(&ctx(&notes, 0.1, 8), &mut buffer, Some(&mut tap));
        assert_eq!(voices, 1);
        assert!(tap.iter().any(|s| s.peak() > 0.0));
        assert!(buffer.iter().all(|s| s.peak() == 0.0));
    }
}
