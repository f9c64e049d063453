//! Control-thread half of the engine
//!
//! [`EngineController`] owns everything that may allocate, parse or log:
//! song loading, performance switching, parameter writes and telemetry
//! draining. Every mutation either publishes a complete new snapshot or
//! writes a single atomic, so a failed operation leaves the engine exactly
//! as it was.

use std::sync::Arc;

use basedrop::{Handle, Shared};

use crate::config::{EngineConfig, StopPolicy};
use crate::error::{EngineError, EngineResult};
use crate::graph::Topology;
use crate::queue::{
    command_channel, telemetry_channel, CommandSender, EngineCommand, ParameterKey,
    TelemetryConsumer, TelemetryRecord,
};
use crate::song::{SongDocument, SongState};
use crate::types::{MAX_GAIN_DB, MIN_GAIN_DB};

use super::gc::gc_handle;
use super::params::ParameterChange;
use super::renderer::EngineRenderer;
use super::snapshot::{EngineShared, LoadedSong, Snapshot};
use super::stats::{CountersSnapshot, RenderStats};
use super::transport::{clamp_position, Transport, TransportState};

/// Slowest tempo multiplier
pub const MIN_TEMPO_MULTIPLIER: f64 = 0.25;
/// Fastest tempo multiplier
pub const MAX_TEMPO_MULTIPLIER: f64 = 4.0;

pub struct EngineController {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    commands: CommandSender,
    telemetry: TelemetryConsumer,
    gc: Handle,
    /// Song currently published, mirrored here so reads need no snapshot
    song: Option<Arc<LoadedSong>>,
    performance: usize,
    snapshot_generation: u64,
    song_generation: u64,
}

impl EngineController {
    /// Create a controller and the renderer it drives
    ///
    /// The renderer is meant to be moved to the audio thread.
    pub fn new(config: EngineConfig) -> EngineResult<(Self, EngineRenderer)> {
        config.validate()?;

        let shared = Arc::new(EngineShared::new());
        let (commands, command_rx) = command_channel(config.command_capacity);
        let (producer, telemetry) = telemetry_channel(config.telemetry_capacity);
        let renderer = EngineRenderer::new(&config, Arc::clone(&shared), command_rx, producer);

        log::info!(
            "Engine created: {} Hz, {} frame blocks, {} channels, up to {} nodes",
            config.sample_rate,
            config.block_size,
            config.channel_count,
            config.max_nodes
        );

        let controller = Self {
            config,
            shared,
            commands,
            telemetry,
            gc: gc_handle(),
            song: None,
            performance: 0,
            snapshot_generation: 0,
            song_generation: 0,
        };
        Ok((controller, renderer))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn publish(&mut self) {
        self.snapshot_generation += 1;
        let snapshot = Snapshot {
            generation: self.snapshot_generation,
            song: self.song.clone(),
            performance: self.performance,
        };
        self.shared.snapshot.set(Shared::new(&self.gc, snapshot));
    }

    // ─────────────────────────────────────────────────────────────
    // Songs and performances
    // ─────────────────────────────────────────────────────────────

    /// Parse, validate and publish a song document
    ///
    /// On any error the previously loaded song stays active and untouched.
    pub fn load_song_from_json(&mut self, json: &str) -> EngineResult<()> {
        match SongState::from_json(json, self.config.max_nodes) {
            Ok(state) => {
                self.install(state);
                Ok(())
            }
            Err(e) => {
                log::warn!("Song load rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Validate and publish an already parsed document
    pub fn load_song(&mut self, document: SongDocument) -> EngineResult<()> {
        match SongState::from_document(document, self.config.max_nodes) {
            Ok(state) => {
                self.install(state);
                Ok(())
            }
            Err(e) => {
                log::warn!("Song load rejected: {}", e);
                Err(e.into())
            }
        }
    }

    fn install(&mut self, state: SongState) {
        self.song_generation += 1;
        let performance = state.default_performance();
        log::info!(
            "Loaded song '{}' ({} nodes, {:.2}s, {} performances)",
            state.id(),
            state.graph().node_count(),
            state.duration(),
            state.performances().len()
        );

        // Stopped before publishing: a block still holding the previous song
        // can no longer advance the playhead past the new one
        self.shared.transport.stop(StopPolicy::ResetToZero);
        self.song = Some(Arc::new(LoadedSong::new(state, self.song_generation)));
        self.performance = performance;
        self.publish();
    }

    /// Routing of the loaded song
    pub fn topology(&self) -> Option<Topology> {
        let document = self.song.as_ref()?.state.document();
        Some(Topology {
            buses: document.buses.clone(),
            sends: document.sends.clone(),
            nodes: document.nodes.clone(),
        })
    }

    /// Swap the routing graph of the loaded song while it keeps playing
    ///
    /// Tracks, notes, tempo and performances are revalidated against the new
    /// graph. Faders of nodes that keep their id keep their level, the active
    /// performance stays active when it still exists, and the transport is
    /// left alone. On error nothing changes.
    pub fn replace_topology(&mut self, topology: Topology) -> EngineResult<()> {
        let current = self.song.clone().ok_or(EngineError::NoSong)?;
        let mut document = current.state.document().clone();
        document.buses = topology.buses;
        document.sends = topology.sends;
        document.nodes = topology.nodes;

        let state = SongState::from_document(document, self.config.max_nodes).map_err(|e| {
            log::warn!("Routing edit rejected: {}", e);
            EngineError::from(e)
        })?;
        let performance = self
            .active_performance_id()
            .and_then(|id| state.performance_index(id))
            .unwrap_or_else(|| state.default_performance());

        self.song_generation += 1;
        log::info!(
            "Rerouted song '{}': {} nodes, {} sends",
            state.id(),
            state.graph().node_count(),
            state.document().sends.len()
        );
        self.song = Some(Arc::new(LoadedSong::rerouted(
            state,
            self.song_generation,
            &current,
        )));
        self.performance = performance;
        self.publish();
        Ok(())
    }

    /// Unload the current song; the renderer outputs silence afterwards
    pub fn clear_song(&mut self) {
        if let Some(song) = &self.song {
            log::info!("Cleared song '{}'", song.state.id());
        }
        self.shared.transport.stop(StopPolicy::ResetToZero);
        self.song = None;
        self.performance = 0;
        self.publish();
    }

    /// Id of the loaded song, if any
    pub fn current_song_id(&self) -> Option<&str> {
        self.song.as_ref().map(|s| s.state.id())
    }

    /// Activate another performance of the current song
    ///
    /// Fader positions and the transport carry over unchanged.
    pub fn switch_performance(&mut self, id: &str) -> EngineResult<()> {
        let index = self
            .song
            .as_ref()
            .and_then(|s| s.state.performance_index(id))
            .ok_or_else(|| EngineError::UnknownPerformance(id.to_string()))?;
        if index != self.performance {
            self.performance = index;
            self.publish();
            log::info!("Switched to performance '{}'", id);
        }
        Ok(())
    }

    pub fn active_performance_id(&self) -> Option<&str> {
        let song = self.song.as_ref()?;
        song.state
            .performances()
            .get(self.performance)
            .map(|p| p.id.as_str())
    }

    pub fn available_performance_ids(&self) -> Vec<String> {
        self.song
            .as_ref()
            .map(|s| s.state.performances().iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Canonical JSON of the loaded song, `None` without a song
    pub fn song_state_json(&self) -> EngineResult<Option<String>> {
        match &self.song {
            Some(song) => Ok(Some(song.state.to_json()?)),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    /// Length of the loaded song in seconds, 0 without a song
    pub fn song_duration(&self) -> f64 {
        self.song.as_ref().map_or(0.0, |s| s.state.duration())
    }

    /// Start playing at `position` seconds, clamped to the song
    pub fn play(&self, position: f64) {
        self.shared
            .transport
            .play(clamp_position(position, self.song_duration()));
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.shared.transport.pause()
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.shared.transport.resume()
    }

    /// Stop; the position follows the configured stop policy
    pub fn stop(&self) {
        self.shared.transport.stop(self.config.stop_policy);
    }

    /// Move the playhead, clamped to `[0, duration]`
    pub fn set_position(&self, position: f64) {
        self.shared
            .transport
            .set_position(clamp_position(position, self.song_duration()));
    }

    pub fn position(&self) -> f64 {
        self.shared.transport.position()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.transport.is_playing()
    }

    pub fn transport(&self) -> Transport {
        let word = self.shared.transport.load();
        Transport {
            position: word.position(),
            state: word.state(),
            tempo_multiplier: self.tempo_multiplier(),
        }
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.transport.state()
    }

    // ─────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────

    pub fn set_master_gain(&self, db: f64) {
        self.set_master_gain_with(db, ParameterChange::default());
    }

    /// Set the master gain in dB; non-finite values are ignored
    pub fn set_master_gain_with(&self, db: f64, change: ParameterChange) {
        if !db.is_finite() {
            log::warn!("Ignoring non-finite master gain {}", db);
            return;
        }
        self.shared
            .master_gain_db
            .store(db.clamp(MIN_GAIN_DB, MAX_GAIN_DB), change);
    }

    pub fn master_gain(&self) -> f64 {
        self.shared.master_gain_db.load()
    }

    /// Scale playback speed; non-finite values are ignored
    pub fn set_tempo_multiplier(&self, multiplier: f64) {
        if !multiplier.is_finite() {
            log::warn!("Ignoring non-finite tempo multiplier {}", multiplier);
            return;
        }
        self.shared.tempo_multiplier.store(
            multiplier.clamp(MIN_TEMPO_MULTIPLIER, MAX_TEMPO_MULTIPLIER),
            ParameterChange::default(),
        );
    }

    pub fn tempo_multiplier(&self) -> f64 {
        self.shared.tempo_multiplier.load()
    }

    /// Set the fader of a graph node of the current song
    pub fn set_node_volume(&self, node_id: &str, db: f64, change: ParameterChange) -> EngineResult<()> {
        let cell = self
            .song
            .as_ref()
            .and_then(|s| s.node_volume(s.state.graph().index_of(node_id)?))
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))?;
        if !db.is_finite() {
            log::warn!("Ignoring non-finite volume {} for '{}'", db, node_id);
            return Ok(());
        }
        cell.store(db.clamp(MIN_GAIN_DB, MAX_GAIN_DB), change);
        Ok(())
    }

    pub fn node_volume(&self, node_id: &str) -> Option<f64> {
        let song = self.song.as_ref()?;
        song.node_volume(song.state.graph().index_of(node_id)?)
            .map(|c| c.load())
    }

    // ─────────────────────────────────────────────────────────────
    // Stream format and render state
    // ─────────────────────────────────────────────────────────────

    /// Adopt a new stream format from the next block on
    pub fn prepare(&mut self, sample_rate: u32, block_size: usize, channel_count: usize) -> EngineResult<()> {
        if sample_rate == 0 || block_size == 0 || channel_count == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "prepare({}, {}, {}): all values must be positive",
                sample_rate, block_size, channel_count
            )));
        }
        self.commands.send(EngineCommand::Prepare {
            sample_rate,
            block_size,
            channel_count,
        })?;
        self.config.sample_rate = sample_rate;
        self.config.block_size = block_size;
        self.config.channel_count = channel_count;
        log::debug!(
            "Prepared for {} Hz, {} frames, {} channels",
            sample_rate,
            block_size,
            channel_count
        );
        Ok(())
    }

    /// Clear ramps, load level and dropout history on the render thread
    pub fn reset(&mut self) -> EngineResult<()> {
        self.commands.send(EngineCommand::Reset)
    }

    /// Force the load level; 0 restores full quality
    pub fn set_load_level(&mut self, level: u8) -> EngineResult<()> {
        self.commands.send(EngineCommand::SetLoadLevel(level))
    }

    // ─────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────

    /// Statistics of the last completed block
    pub fn render_stats(&self) -> RenderStats {
        self.shared.stats.read()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot(self.telemetry.dropped())
    }

    /// Drain up to `max_count` telemetry events with parameter ids resolved
    pub fn drain_telemetry(&mut self, max_count: usize) -> Vec<TelemetryRecord> {
        let events = self.telemetry.drain(max_count);
        events
            .iter()
            .map(|event| TelemetryRecord::from_event(event, |key| self.parameter_id(key)))
            .collect()
    }

    /// Stable id of a parameter
    ///
    /// Node faders of an unloaded song can no longer be named and fall back
    /// to their index.
    pub fn parameter_id(&self, key: ParameterKey) -> String {
        match key {
            ParameterKey::MasterGain => "master_gain".to_string(),
            ParameterKey::TempoMultiplier => "tempo_multiplier".to_string(),
            ParameterKey::NodeVolume {
                node,
                graph_generation,
            } => {
                let name = self
                    .song
                    .as_ref()
                    .filter(|s| s.generation == graph_generation)
                    .and_then(|s| s.state.graph().nodes().get(node as usize))
                    .map(|n| n.id.as_str());
                match name {
                    Some(id) => format!("{}/volume_db", id),
                    None => format!("node#{}/volume_db", node),
                }
            }
        }
    }
}
