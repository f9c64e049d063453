//! Real-time render entry point
//!
//! [`EngineRenderer::process`] is the only code that runs on the audio
//! thread. Per block it:
//!
//! 1. applies pending commands
//! 2. takes one reference to the current snapshot (held until the block ends)
//! 3. polls parameters, emitting telemetry for every change
//! 4. renders the graph in sub-blocks of at most `max_block_frames`
//! 5. advances the transport with a single compare-and-swap
//! 6. publishes render stats and feeds the dropout monitor
//!
//! Nothing here allocates, locks, logs or returns an error.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::graph::{GainStage, GraphRenderer, ProcessContext};
use crate::pool::MemoryPool;
use crate::queue::{EngineCommand, ParameterKey, TelemetryProducer};
use crate::song::DEFAULT_BPM;
use crate::types::StereoSample;

use super::dropout::DropoutMonitor;
use super::params::{ParameterTracker, NODE_SLOT_BASE, SLOT_MASTER_GAIN, SLOT_TEMPO_MULTIPLIER};
use super::snapshot::{EngineShared, LoadedSong};
use super::stats::{EngineCounters, RenderStats};
use super::transport::TransportState;

/// Render-thread half of the engine
pub struct EngineRenderer {
    shared: Arc<EngineShared>,
    commands: rtrb::Consumer<EngineCommand>,
    command_budget: usize,
    telemetry: TelemetryProducer,
    pool: MemoryPool<StereoSample>,
    graph: GraphRenderer,
    tracker: ParameterTracker,
    dropout: DropoutMonitor,
    master: GainStage,
    sample_rate: u32,
    config: EngineConfig,
}

impl EngineRenderer {
    pub(crate) fn new(
        config: &EngineConfig,
        shared: Arc<EngineShared>,
        commands: rtrb::Consumer<EngineCommand>,
        telemetry: TelemetryProducer,
    ) -> Self {
        let mut tracker = ParameterTracker::new(config.max_nodes);
        let master_db = shared.master_gain_db.load();
        tracker.seed(SLOT_MASTER_GAIN, master_db);
        tracker.seed(SLOT_TEMPO_MULTIPLIER, shared.tempo_multiplier.load());

        Self {
            commands,
            command_budget: config.command_capacity,
            telemetry,
            pool: MemoryPool::new(&config.pool),
            graph: GraphRenderer::new(
                config.max_nodes,
                config.max_block_frames,
                config.sample_rate as f64,
            ),
            tracker,
            dropout: DropoutMonitor::new(&config.dropout),
            master: GainStage::new(master_db),
            sample_rate: config.sample_rate,
            config: config.clone(),
            shared,
        }
    }

    /// Current sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Render one host block into non-interleaved `outputs`
    ///
    /// Channel 0 receives left, channel 1 right; a single channel receives
    /// the mono sum; further channels are silent. At most `frame_count`
    /// frames are written to the first `channel_count` channels.
    pub fn process(&mut self, outputs: &mut [&mut [f32]], channel_count: usize, frame_count: usize) {
        let started = Instant::now();
        self.apply_commands();

        let channels = channel_count.min(outputs.len());
        let frames = outputs[..channels]
            .iter()
            .map(|c| c.len())
            .min()
            .unwrap_or(0)
            .min(frame_count);
        for channel in outputs[..channels].iter_mut() {
            channel[..frames].fill(0.0);
        }

        // Held for the whole block: every read below sees this one snapshot
        let snapshot = self.shared.snapshot.get();
        let word = self.shared.transport.load();
        let tempo_multiplier = self.poll_engine_parameters();
        let sample_rate = self.sample_rate as f64;

        let mut stats = RenderStats {
            position: word.position(),
            tempo: DEFAULT_BPM * tempo_multiplier,
            beats_per_bar: 4,
            ..RenderStats::default()
        };

        match snapshot.active() {
            Some((song, performance)) => {
                self.bind_if_needed(song);
                self.poll_node_parameters(song);

                let playing = word.state() == TransportState::Playing;
                let seconds_per_frame = tempo_multiplier / sample_rate;
                let voice_limit = self.config.voices_at_level(self.dropout.level());
                let main = song.state.graph().main_output();
                let start = word.position();

                let mut done = 0;
                while done < frames {
                    let n = (frames - done).min(self.graph.max_frames());
                    let timing = ProcessContext {
                        window_start: start + done as f64 * seconds_per_frame,
                        seconds_per_frame,
                        tempo_multiplier,
                        playing,
                        voice_limit,
                        ..ProcessContext::silent()
                    };
                    let outcome = self.graph.render(&song.state, performance, &timing, n);
                    stats.active_notes = stats.active_notes.max(outcome.active_notes);
                    if let Some(block) = self.graph.output_mut(main, n) {
                        self.master.apply(block);
                        write_channels(outputs, channels, done, block);
                    }
                    done += n;
                }

                if playing {
                    let duration = song.state.duration();
                    let end = start + frames as f64 * seconds_per_frame;
                    let finished = end >= duration;
                    self.shared
                        .transport
                        .advance(word, end.min(duration), finished);
                }

                stats.total_notes = performance.total_notes();
                stats.position = self.shared.transport.position();
                let tempo = song.state.tempo().at(stats.position);
                stats.tempo = tempo.bpm * tempo_multiplier;
                stats.beats_per_bar = tempo.beats_per_bar;
            }
            None => {
                if self.graph.bound_generation().is_some() {
                    self.graph.unbind(&self.pool);
                }
            }
        }
        drop(snapshot);

        self.shared.stats.publish(&stats);
        EngineCounters::bump(&self.shared.counters.blocks_rendered);
        if frames > 0 {
            let budget = Duration::from_secs_f64(frames as f64 / sample_rate);
            self.observe_cost(started.elapsed(), budget);
        }
    }

    fn apply_commands(&mut self) {
        for _ in 0..self.command_budget {
            let Ok(command) = self.commands.pop() else {
                break;
            };
            match command {
                EngineCommand::Reset => {
                    self.graph.reset();
                    self.master.settle();
                    self.dropout.reset();
                    self.shared.counters.load_level.store(0, Ordering::Relaxed);
                }
                EngineCommand::Prepare { sample_rate, .. } => {
                    if sample_rate > 0 {
                        self.sample_rate = sample_rate;
                        self.graph.prepare(sample_rate as f64);
                        self.master.settle();
                    }
                }
                EngineCommand::SetLoadLevel(level) => {
                    self.dropout.set_level(level);
                    self.shared
                        .counters
                        .load_level
                        .store(self.dropout.level(), Ordering::Relaxed);
                }
            }
            EngineCounters::bump(&self.shared.counters.commands_applied);
        }
    }

    #[inline]
    fn ramp_frames(&self, duration_ms: u32) -> usize {
        (duration_ms as u64 * self.sample_rate as u64 / 1000) as usize
    }

    /// Poll master gain and tempo; returns the tempo multiplier for this block
    fn poll_engine_parameters(&mut self) -> f64 {
        let (gain_db, change) = self.shared.master_gain_db.load_with_change();
        if let Some(previous) = self.tracker.observe(SLOT_MASTER_GAIN, gain_db) {
            self.master.set_db(gain_db, self.ramp_frames(change.duration_ms));
            self.telemetry.parameter_change(
                ParameterKey::MasterGain,
                previous,
                gain_db,
                change.is_undo,
                change.duration_ms,
            );
        }

        let (tempo, change) = self.shared.tempo_multiplier.load_with_change();
        if let Some(previous) = self.tracker.observe(SLOT_TEMPO_MULTIPLIER, tempo) {
            self.telemetry.parameter_change(
                ParameterKey::TempoMultiplier,
                previous,
                tempo,
                change.is_undo,
                change.duration_ms,
            );
        }
        tempo
    }

    fn poll_node_parameters(&mut self, song: &LoadedSong) {
        let count = song.state.graph().node_count();
        for node in 0..count {
            let Some(cell) = song.node_volume(node) else {
                break;
            };
            let (db, change) = cell.load_with_change();
            if let Some(previous) = self.tracker.observe(NODE_SLOT_BASE + node, db) {
                self.graph.set_volume(node, db, self.ramp_frames(change.duration_ms));
                self.telemetry.parameter_change(
                    ParameterKey::NodeVolume {
                        node: node as u32,
                        graph_generation: song.generation,
                    },
                    previous,
                    db,
                    change.is_undo,
                    change.duration_ms,
                );
            }
        }
    }

    /// Rebind node state when a different song is published
    ///
    /// Faders start at the song's baseline volumes; changes made since the
    /// load are picked up by the following parameter poll and reported.
    fn bind_if_needed(&mut self, song: &LoadedSong) {
        if self.graph.bound_generation() == Some(song.generation) {
            return;
        }
        let state = &song.state;
        let exhausted = self.graph.bind(
            state,
            song.generation,
            |node| song.baseline_volume_db(node),
            &self.pool,
        );
        self.shared
            .counters
            .pool_exhausted
            .fetch_add(exhausted as u64, Ordering::Relaxed);
        for node in 0..state.graph().node_count() {
            self.tracker.seed(NODE_SLOT_BASE + node, song.baseline_volume_db(node));
        }
    }

    fn observe_cost(&mut self, elapsed: Duration, budget: Duration) {
        if let Some(signal) = self.dropout.observe(elapsed, budget) {
            let level = self.dropout.level();
            self.shared.counters.load_level.store(level, Ordering::Relaxed);
            self.telemetry.load_signal(signal, level);
        }
        self.shared
            .counters
            .record_load(self.dropout.average_load(), self.dropout.peak_load());
        if elapsed > budget {
            EngineCounters::bump(&self.shared.counters.deadline_overruns);
            self.telemetry
                .deadline_overrun(elapsed.as_micros() as u64, budget.as_micros() as u64);
        }
    }
}

impl Drop for EngineRenderer {
    fn drop(&mut self) {
        self.graph.unbind(&self.pool);
    }
}

/// Copy a stereo block into host channels starting at frame `offset`
fn write_channels(outputs: &mut [&mut [f32]], channels: usize, offset: usize, block: &[StereoSample]) {
    match channels {
        0 => {}
        1 => {
            let out = &mut outputs[0][offset..offset + block.len()];
            for (o, s) in out.iter_mut().zip(block) {
                *o = (s.left + s.right) * 0.5;
            }
        }
        _ => {
            let (left, rest) = outputs.split_at_mut(1);
            let left = &mut left[0][offset..offset + block.len()];
            let right = &mut rest[0][offset..offset + block.len()];
            for ((l, r), s) in left.iter_mut().zip(right.iter_mut()).zip(block) {
                *l = s.left;
                *r = s.right;
            }
        }
    }
}
