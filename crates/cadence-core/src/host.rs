//! Host-facing control surface
//!
//! [`EngineHandle`] is what an embedding host holds. The engine behind it is
//! created lazily on the first call that needs one, so a host can construct
//! the handle early and configure it later. Errors are logged at `warn` and
//! mapped to the plain `bool`/`String` returns hosts expect.
//!
//! Two ways to drive audio:
//!
//! - single-threaded hosts and offline renders call [`EngineHandle::process`]
//! - real-time hosts move the renderer to the audio thread with
//!   [`EngineHandle::take_renderer`], after which `process` on the handle
//!   outputs silence
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = EngineHandle::new(EngineConfig::default());
//! engine.prepare(48000, 512, 2);
//! if engine.load_song_from_json(&json) {
//!     engine.play(0.0);
//! }
//! let mut renderer = engine.take_renderer().expect("engine initialized");
//! std::thread::spawn(move || loop {
//!     renderer.process(&mut [&mut left, &mut right], 2, 512);
//! });
//! ```

use crate::config::EngineConfig;
use crate::engine::{
    CountersSnapshot, EngineController, EngineRenderer, ParameterChange, RenderStats, Transport,
};
use crate::error::{EngineError, EngineResult};
use crate::graph::Topology;
use crate::queue::TelemetryRecord;

/// Lazily created engine owned by the host
pub struct EngineHandle {
    config: EngineConfig,
    controller: Option<EngineController>,
    renderer: Option<EngineRenderer>,
    renderer_taken: bool,
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EngineHandle {
    /// Handle that creates its engine from `config` on first use
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            controller: None,
            renderer: None,
            renderer_taken: false,
        }
    }

    fn engine(&mut self) -> EngineResult<&mut EngineController> {
        if self.controller.is_none() {
            let (controller, renderer) = EngineController::new(self.config.clone())?;
            self.controller = Some(controller);
            self.renderer = Some(renderer);
        }
        self.controller.as_mut().ok_or(EngineError::NotInitialized)
    }

    /// Run `op` against the engine, creating it if needed; logs failures
    fn with_engine<T>(
        &mut self,
        action: &str,
        op: impl FnOnce(&mut EngineController) -> EngineResult<T>,
    ) -> Option<T> {
        match self.engine().and_then(op) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("{} failed: {}", action, e);
                None
            }
        }
    }

    /// Create the engine now instead of on first use
    pub fn initialize(&mut self) -> bool {
        self.with_engine("initialize", |_| Ok(())).is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.controller.is_some()
    }

    /// The engine, if it has been created
    pub fn controller(&self) -> Option<&EngineController> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut EngineController> {
        self.controller.as_mut()
    }

    /// Move the renderer out for a dedicated audio thread
    ///
    /// Creates the engine if needed. Returns `None` once the renderer has
    /// been taken.
    pub fn take_renderer(&mut self) -> Option<EngineRenderer> {
        self.with_engine("take renderer", |_| Ok(()))?;
        let renderer = self.renderer.take();
        self.renderer_taken |= renderer.is_some();
        renderer
    }

    // ─────────────────────────────────────────────────────────────
    // Songs and performances
    // ─────────────────────────────────────────────────────────────

    pub fn load_song_from_json(&mut self, json: &str) -> bool {
        self.with_engine("load song", |e| e.load_song_from_json(json))
            .is_some()
    }

    /// Id of the loaded song, empty without one
    pub fn current_song_id(&self) -> String {
        self.controller
            .as_ref()
            .and_then(|c| c.current_song_id())
            .unwrap_or_default()
            .to_string()
    }

    /// Routing of the loaded song, `None` without one
    pub fn topology(&self) -> Option<Topology> {
        self.controller.as_ref().and_then(|c| c.topology())
    }

    /// Swap the routing graph without interrupting playback
    pub fn replace_topology(&mut self, topology: Topology) -> bool {
        self.with_engine("replace topology", |e| e.replace_topology(topology))
            .is_some()
    }

    pub fn clear_song(&mut self) {
        self.with_engine("clear song", |e| {
            e.clear_song();
            Ok(())
        });
    }

    pub fn switch_performance(&mut self, id: &str) -> bool {
        self.with_engine("switch performance", |e| e.switch_performance(id))
            .is_some()
    }

    /// Id of the active performance, empty without a song
    pub fn active_performance_id(&self) -> String {
        self.controller
            .as_ref()
            .and_then(|c| c.active_performance_id())
            .unwrap_or_default()
            .to_string()
    }

    pub fn available_performance_ids(&self) -> Vec<String> {
        self.controller
            .as_ref()
            .map(|c| c.available_performance_ids())
            .unwrap_or_default()
    }

    /// Canonical song JSON, empty without a song
    pub fn song_state_json(&mut self) -> String {
        self.with_engine("song state", |e| e.song_state_json())
            .flatten()
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    pub fn play(&mut self, position: f64) {
        self.with_engine("play", |e| {
            e.play(position);
            Ok(())
        });
    }

    pub fn stop(&mut self) {
        self.with_engine("stop", |e| {
            e.stop();
            Ok(())
        });
    }

    /// Pause playback; `false` unless the transport was playing
    pub fn pause(&mut self) -> bool {
        self.with_engine("pause", |e| e.pause()).is_some()
    }

    /// Resume playback; `false` unless the transport was paused
    pub fn resume(&mut self) -> bool {
        self.with_engine("resume", |e| e.resume()).is_some()
    }

    pub fn set_position(&mut self, position: f64) {
        self.with_engine("set position", |e| {
            e.set_position(position);
            Ok(())
        });
    }

    pub fn position(&self) -> f64 {
        self.controller.as_ref().map_or(0.0, |c| c.position())
    }

    pub fn is_playing(&self) -> bool {
        self.controller.as_ref().is_some_and(|c| c.is_playing())
    }

    pub fn transport(&self) -> Option<Transport> {
        self.controller.as_ref().map(|c| c.transport())
    }

    // ─────────────────────────────────────────────────────────────
    // Parameters
    // ─────────────────────────────────────────────────────────────

    pub fn set_master_gain(&mut self, db: f64) {
        self.set_master_gain_with(db, ParameterChange::default());
    }

    pub fn set_master_gain_with(&mut self, db: f64, change: ParameterChange) {
        self.with_engine("set master gain", |e| {
            e.set_master_gain_with(db, change);
            Ok(())
        });
    }

    pub fn master_gain(&self) -> f64 {
        self.controller.as_ref().map_or(0.0, |c| c.master_gain())
    }

    pub fn set_tempo_multiplier(&mut self, multiplier: f64) {
        self.with_engine("set tempo multiplier", |e| {
            e.set_tempo_multiplier(multiplier);
            Ok(())
        });
    }

    pub fn tempo_multiplier(&self) -> f64 {
        self.controller.as_ref().map_or(1.0, |c| c.tempo_multiplier())
    }

    pub fn set_node_volume(&mut self, node_id: &str, db: f64, change: ParameterChange) -> bool {
        self.with_engine("set node volume", |e| e.set_node_volume(node_id, db, change))
            .is_some()
    }

    // ─────────────────────────────────────────────────────────────
    // Stream format
    // ─────────────────────────────────────────────────────────────

    /// Set the stream format; later blocks render at the new sample rate
    pub fn prepare(&mut self, sample_rate: u32, block_size: usize, channel_count: usize) -> bool {
        self.with_engine("prepare", |e| e.prepare(sample_rate, block_size, channel_count))
            .is_some()
    }

    pub fn reset(&mut self) -> bool {
        self.with_engine("reset", |e| e.reset()).is_some()
    }

    pub fn set_load_level(&mut self, level: u8) -> bool {
        self.with_engine("set load level", |e| e.set_load_level(level))
            .is_some()
    }

    // ─────────────────────────────────────────────────────────────
    // Rendering and observation
    // ─────────────────────────────────────────────────────────────

    /// Render one block with the renderer this handle still owns
    ///
    /// Writes silence when the renderer has been taken or the engine could
    /// not be created.
    pub fn process(&mut self, outputs: &mut [&mut [f32]], channel_count: usize, frame_count: usize) {
        if !self.renderer_taken && self.renderer.is_none() {
            self.with_engine("process", |_| Ok(()));
        }
        match self.renderer.as_mut() {
            Some(renderer) => renderer.process(outputs, channel_count, frame_count),
            None => {
                for channel in outputs.iter_mut().take(channel_count) {
                    let frames = frame_count.min(channel.len());
                    channel[..frames].fill(0.0);
                }
            }
        }
    }

    pub fn render_stats(&self) -> RenderStats {
        self.controller
            .as_ref()
            .map(|c| c.render_stats())
            .unwrap_or_default()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.controller
            .as_ref()
            .map(|c| c.counters())
            .unwrap_or_default()
    }

    /// Drain up to `max_count` telemetry records
    pub fn drain_telemetry(&mut self, max_count: usize) -> Vec<TelemetryRecord> {
        self.controller
            .as_mut()
            .map(|c| c.drain_telemetry(max_count))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportState;
    use crate::song::tests::ARRANGED_SONG;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const BLOCK: usize = 512;

    /// One note at 0 lasting half a second in a two second song
    const ONE_NOTE: &str = r#"{
        "id": "one-note",
        "durationSeconds": 2.0,
        "buses": [{ "id": "master", "name": "Master", "index": 0, "type": "MASTER" }],
        "nodes": [
            { "id": "master", "name": "Master", "type": "BUS", "index": 0 },
            { "id": "lead", "name": "Lead", "type": "TRACK", "index": 1, "outputIds": ["master"] }
        ],
        "tracks": [{ "id": "lead", "notes": [{ "time": 0, "duration": 0.5, "pitch": 69 }] }]
    }"#;

    fn process(engine: &mut EngineHandle) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        engine.process(&mut [&mut left[..], &mut right[..]], 2, BLOCK);
        (left, right)
    }

    #[test]
    fn test_lazy_creation() {
        let mut engine = EngineHandle::default();
        assert!(!engine.is_initialized());
        assert_eq!(engine.current_song_id(), "");
        assert_eq!(engine.position(), 0.0);
        assert!(!engine.is_playing());

        assert!(engine.load_song_from_json(ONE_NOTE));
        assert!(engine.is_initialized());
        assert_eq!(engine.current_song_id(), "one-note");
    }

    #[test]
    fn test_invalid_config_never_initializes() {
        let mut engine = EngineHandle::new(EngineConfig {
            max_nodes: 0,
            ..EngineConfig::default()
        });
        assert!(!engine.initialize());
        assert!(!engine.load_song_from_json(ONE_NOTE));

        let mut left = vec![1.0f32; 8];
        engine.process(&mut [&mut left[..]], 1, 8);
        assert!(left.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_note_sounds_then_ends() {
        let mut engine = EngineHandle::default();
        assert!(engine.prepare(48000, BLOCK, 2));
        assert!(engine.load_song_from_json(ONE_NOTE));
        engine.play(0.0);

        let (left, right) = process(&mut engine);
        let stats = engine.render_stats();
        assert_eq!(stats.active_notes, 1);
        assert_eq!(stats.total_notes, 1);
        assert!(left.iter().any(|&s| s.abs() > 0.01));
        assert_eq!(left, right, "a mono tone is centered");

        // 0.5 s at 512 frames per block is under 47 blocks
        for _ in 0..60 {
            process(&mut engine);
        }
        let stats = engine.render_stats();
        assert_eq!(stats.active_notes, 0);
        assert!(stats.position > 0.5 && stats.position < 2.0);
        assert!(engine.is_playing());
        assert_eq!(stats.tempo, 120.0);
        assert_eq!(stats.beats_per_bar, 4);
    }

    #[test]
    fn test_transport_stops_at_song_end() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ONE_NOTE);
        engine.play(1.99);
        process(&mut engine);
        assert!(!engine.is_playing());
        assert!((engine.position() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_tempo_multiplier_scales_advance() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ONE_NOTE);
        engine.set_tempo_multiplier(2.0);
        engine.play(0.0);
        process(&mut engine);
        let expected = 2.0 * BLOCK as f64 / 48000.0;
        assert!((engine.position() - expected).abs() < 1e-6);
        assert_eq!(engine.render_stats().tempo, 240.0);
    }

    #[test]
    fn test_failed_load_keeps_previous_song() {
        let mut engine = EngineHandle::default();
        assert!(engine.load_song_from_json(ARRANGED_SONG));
        let before = engine.song_state_json();

        let cycle = r#"{
            "id": "cycle",
            "buses": [
                { "id": "m", "name": "M", "index": 0, "type": "MASTER" },
                { "id": "a", "name": "A", "index": 1, "type": "AUX" },
                { "id": "b", "name": "B", "index": 2, "type": "AUX" }
            ],
            "nodes": [
                { "id": "m", "name": "M", "type": "BUS", "index": 0 },
                { "id": "a", "name": "A", "type": "BUS", "index": 1, "inputIds": ["b"] },
                { "id": "b", "name": "B", "type": "BUS", "index": 2, "inputIds": ["a"] }
            ]
        }"#;
        let send_to_master = ARRANGED_SONG.replace(
            r#""destinationBusId": "reverb""#,
            r#""destinationBusId": "master""#,
        );
        for bad in [cycle, send_to_master.as_str(), "[]"] {
            assert!(!engine.load_song_from_json(bad));
            assert_eq!(engine.current_song_id(), "arranged");
            assert_eq!(engine.song_state_json(), before);
        }
    }

    #[test]
    fn test_stop_twice_is_idempotent() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ARRANGED_SONG);
        engine.play(1.0);
        process(&mut engine);

        engine.stop();
        let first = engine.transport().unwrap();
        engine.stop();
        assert_eq!(engine.transport().unwrap(), first);
        assert_eq!(first.state, TransportState::Stopped);
        assert_eq!(first.position, 0.0);
    }

    #[test]
    fn test_pause_and_resume_report_invalid_transitions() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ARRANGED_SONG);
        assert!(!engine.pause());
        engine.play(0.5);
        assert!(engine.pause());
        assert!(!engine.pause());
        assert!(engine.resume());
        assert!(engine.is_playing());
    }

    #[test]
    fn test_master_gain_telemetry_line() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ONE_NOTE);
        process(&mut engine);
        engine.set_master_gain_with(
            -6.0,
            ParameterChange {
                is_undo: false,
                duration_ms: 100,
            },
        );
        process(&mut engine);

        let lines: Vec<String> = engine
            .drain_telemetry(64)
            .iter()
            .map(|r| r.to_json_line())
            .filter(|l| l.contains("parameter_change"))
            .collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["parameter_id"], "master_gain");
        assert_eq!(value["previous_value"], 0.0);
        assert_eq!(value["new_value"], -6.0);
        assert_eq!(value["delta"], 6.0);
        assert_eq!(value["duration_ms"], 100);
    }

    #[test]
    fn test_taken_renderer_leaves_handle_silent() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ONE_NOTE);
        engine.play(0.0);
        let mut renderer = engine.take_renderer().unwrap();
        assert!(engine.take_renderer().is_none());

        let (left, _) = process(&mut engine);
        assert!(left.iter().all(|&s| s == 0.0));

        let mut left = vec![0.0f32; BLOCK];
        renderer.process(&mut [&mut left[..]], 1, BLOCK);
        assert!(left.iter().any(|&s| s.abs() > 0.01));
    }

    /// Two tracks sounding for the whole song; "solo" keeps only the low one
    const DRONE: &str = r#"{
        "id": "drone",
        "durationSeconds": 3600.0,
        "buses": [{ "id": "master", "name": "Master", "index": 0, "type": "MASTER" }],
        "nodes": [
            { "id": "master", "name": "Master", "type": "BUS", "index": 0 },
            { "id": "low", "name": "Low", "type": "TRACK", "index": 1 },
            { "id": "high", "name": "High", "type": "TRACK", "index": 2 }
        ],
        "tracks": [
            { "id": "low", "notes": [{ "time": 0, "duration": 3600, "pitch": 48 }] },
            { "id": "high", "notes": [{ "time": 0, "duration": 3600, "pitch": 72 }] }
        ],
        "performances": [
            { "id": "duo", "name": "Duo" },
            { "id": "solo", "name": "Solo", "trackIds": ["low"] }
        ]
    }"#;

    #[test]
    fn test_performance_switch_mid_stream() {
        let mut engine = EngineHandle::default();
        assert!(engine.load_song_from_json(DRONE));
        engine.play(0.0);
        let mut renderer = engine.take_renderer().unwrap();
        let done = Arc::new(AtomicBool::new(false));

        std::thread::scope(|s| {
            let done_render = Arc::clone(&done);
            s.spawn(move || {
                let mut left = vec![0.0f32; 256];
                let mut right = vec![0.0f32; 256];
                while !done_render.load(Ordering::Acquire) {
                    renderer.process(&mut [&mut left[..], &mut right[..]], 2, 256);
                }
            });

            for i in 0..400 {
                let id = if i % 2 == 0 { "solo" } else { "duo" };
                assert!(engine.switch_performance(id));
                // The voices a block rendered must belong to the performance
                // whose note count it reports
                let stats = engine.render_stats();
                match stats.total_notes {
                    0 => assert_eq!(stats.active_notes, 0),
                    1 | 2 => assert_eq!(
                        stats.active_notes, stats.total_notes,
                        "block mixed two snapshots at {:.3}s",
                        stats.position
                    ),
                    other => panic!("unexpected note count {}", other),
                }
                std::thread::yield_now();
            }
            while engine.counters().blocks_rendered == 0 {
                std::thread::yield_now();
            }
            done.store(true, Ordering::Release);
        });

        assert!(engine.is_playing());
        assert!(engine.position() < 3600.0);
        assert_eq!(engine.active_performance_id(), "duo");
    }

    #[test]
    fn test_reroute_during_playback() {
        let mut engine = EngineHandle::default();
        assert!(engine.load_song_from_json(ARRANGED_SONG));
        engine.play(1.0);
        process(&mut engine);
        let before = engine.position();
        assert!(engine.is_playing());

        let mut topology = engine.topology().unwrap();
        topology.sends[0].amount = 0.5;
        assert!(engine.replace_topology(topology));
        assert!(engine.is_playing());
        assert_eq!(engine.position(), before);

        let mut broken = engine.topology().unwrap();
        broken.sends[0].amount = 2.0;
        assert!(!engine.replace_topology(broken));
        assert_eq!(engine.topology().unwrap().sends[0].amount, 0.5);

        process(&mut engine);
        assert!(engine.position() > before);
        assert_eq!(engine.current_song_id(), "arranged");
    }

    #[test]
    fn test_counters_report_load_window() {
        let mut engine = EngineHandle::default();
        engine.load_song_from_json(ONE_NOTE);
        engine.play(0.0);
        for _ in 0..4 {
            process(&mut engine);
        }
        let counters = engine.counters();
        assert_eq!(counters.blocks_rendered, 4);
        assert!(counters.average_load >= 0.0);
        assert!(counters.peak_load + 1e-9 >= counters.average_load);
    }
}
