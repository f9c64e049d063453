//! Graph rendering on the real-time thread
//!
//! [`GraphRenderer`] owns the per-node render state of the currently bound
//! graph: one processor and one pool block per node, plus a pre-fader tap
//! block for tracks that feed pre-fader sends. Every table is sized for the
//! largest graph at construction, so binding a new graph and rendering both
//! run without allocation.

use crate::pool::{Block, MemoryPool};
use crate::song::{Performance, SongState};
use crate::types::{mix_into, StereoSample};

use super::node::{NodeProcessor, ProcessContext, Processor, PARAM_VOLUME_DB};

/// Result of rendering one sub-block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOutcome {
    /// Voices that sounded across all tracks
    pub active_notes: u32,
}

pub struct GraphRenderer {
    processors: Vec<NodeProcessor>,
    buffers: Vec<Option<Block<StereoSample>>>,
    taps: Vec<Option<Block<StereoSample>>>,
    bound_generation: Option<u64>,
    max_nodes: usize,
    max_frames: usize,
    sample_rate: f64,
}

impl GraphRenderer {
    pub fn new(max_nodes: usize, max_frames: usize, sample_rate: f64) -> Self {
        Self {
            processors: Vec::with_capacity(max_nodes),
            buffers: Vec::with_capacity(max_nodes),
            taps: Vec::with_capacity(max_nodes),
            bound_generation: None,
            max_nodes,
            max_frames,
            sample_rate,
        }
    }

    /// Most frames one [`render`](Self::render) call may produce
    #[inline]
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Generation of the graph currently bound, if any
    #[inline]
    pub fn bound_generation(&self) -> Option<u64> {
        self.bound_generation
    }

    /// Bind to a new graph, returning the number of nodes left without a buffer
    ///
    /// Blocks of the previous graph go back to the pool first. A node whose
    /// block cannot be acquired renders silence.
    pub fn bind(
        &mut self,
        song: &SongState,
        generation: u64,
        volume_db: impl Fn(usize) -> f64,
        pool: &MemoryPool<StereoSample>,
    ) -> u32 {
        self.unbind(pool);

        let nodes = song.graph().nodes();
        let count = nodes.len().min(self.max_nodes);
        let mut exhausted = 0;
        for (i, node) in nodes.iter().take(count).enumerate() {
            self.processors
                .push(NodeProcessor::for_node(node, volume_db(i), self.sample_rate));
            let block = pool.acquire_len(self.max_frames).ok();
            if block.is_none() {
                exhausted += 1;
            }
            self.buffers.push(block);
            let tap = if node.feeds_pre_fader {
                let tap = pool.acquire_len(self.max_frames).ok();
                if tap.is_none() {
                    exhausted += 1;
                }
                tap
            } else {
                None
            };
            self.taps.push(tap);
        }
        self.bound_generation = Some(generation);
        exhausted
    }

    /// Return every block to the pool and forget the graph
    pub fn unbind(&mut self, pool: &MemoryPool<StereoSample>) {
        for block in self.buffers.drain(..).chain(self.taps.drain(..)).flatten() {
            pool.release(block);
        }
        self.processors.clear();
        self.bound_generation = None;
    }

    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for processor in &mut self.processors {
            processor.prepare(sample_rate, self.max_frames);
        }
    }

    pub fn reset(&mut self) {
        for processor in &mut self.processors {
            processor.reset();
        }
    }

    /// Set a node's fader, ramping over `ramp_frames`
    pub fn set_volume(&mut self, node: usize, db: f64, ramp_frames: usize) {
        if let Some(processor) = self.processors.get_mut(node) {
            processor.set_parameter(PARAM_VOLUME_DB, db, ramp_frames);
        }
    }

    /// Render `frames` frames of the bound graph in processing order
    ///
    /// `timing` supplies the transport fields of the context; note data is
    /// filled in per track. `frames` is capped at [`max_frames`](Self::max_frames).
    pub fn render(
        &mut self,
        song: &SongState,
        performance: &Performance,
        timing: &ProcessContext<'_>,
        frames: usize,
    ) -> RenderOutcome {
        let frames = frames.min(self.max_frames);
        let graph = song.graph();
        let mut active_notes = 0u32;

        for &idx in graph.order() {
            if idx >= self.processors.len() {
                continue;
            }
            let Some(mut block) = self.buffers[idx].take() else {
                continue;
            };
            let buffer = &mut block.as_mut_slice()[..frames];
            buffer.fill(StereoSample::silence());

            if performance.is_active(idx) {
                let node = &graph.nodes()[idx];
                for &input in node.inputs.iter() {
                    if let Some(source) = &self.buffers[input] {
                        mix_into(buffer, &source.as_slice()[..frames], 1.0);
                    }
                }
                for send in node.sends.iter() {
                    let source = if send.pre_fader {
                        &self.taps[send.source]
                    } else {
                        &self.buffers[send.source]
                    };
                    if let Some(source) = source {
                        mix_into(buffer, &source.as_slice()[..frames], send.amount);
                    }
                }

                let ctx = ProcessContext {
                    notes: song.notes(idx),
                    max_note_duration: song.max_note_duration(idx),
                    ..*timing
                };
                let mut tap = self.taps[idx].take();
                let voices = self.processors[idx].process(
                    &ctx,
                    buffer,
                    tap.as_mut().map(|t| &mut t.as_mut_slice()[..frames]),
                );
                self.taps[idx] = tap;
                active_notes += voices as u32;
            } else if let Some(tap) = self.taps[idx].as_mut() {
                tap.as_mut_slice()[..frames].fill(StereoSample::silence());
            }

            self.buffers[idx] = Some(block);
        }

        RenderOutcome { active_notes }
    }

    /// Output of a node from the last render, `frames` long
    pub fn output_mut(&mut self, node: usize, frames: usize) -> Option<&mut [StereoSample]> {
        let frames = frames.min(self.max_frames);
        self.buffers
            .get_mut(node)?
            .as_mut()
            .map(|block| &mut block.as_mut_slice()[..frames])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolClassConfig;
    use crate::song::SongDocument;

    const FRAMES: usize = 256;

    fn pool(blocks: usize) -> MemoryPool<StereoSample> {
        MemoryPool::new(&[PoolClassConfig {
            block_frames: FRAMES,
            blocks,
        }])
    }

    fn song(json: &str) -> SongState {
        SongState::from_document(SongDocument::from_json(json).unwrap(), 16).unwrap()
    }

    fn timing(start: f64) -> ProcessContext<'static> {
        ProcessContext {
            window_start: start,
            seconds_per_frame: 1.0 / 48000.0,
            playing: true,
            voice_limit: 8,
            ..ProcessContext::silent()
        }
    }

    const ONE_TRACK: &str = r#"{
        "id": "one",
        "buses": [{ "id": "m", "name": "M", "index": 0, "type": "MASTER" }],
        "nodes": [
            { "id": "m", "name": "M", "type": "BUS", "index": 0 },
            { "id": "t", "name": "T", "type": "TRACK", "index": 1 }
        ],
        "tracks": [{ "id": "t", "notes": [{ "time": 0, "duration": 1, "pitch": 69, "velocity": 1 }] }]
    }"#;

    /// Track "t" feeds group "g" directly and aux "a" through a pre-fader send
    const PRE_FADER: &str = r#"{
        "id": "pre",
        "buses": [
            { "id": "m", "name": "M", "index": 0, "type": "MASTER" },
            { "id": "a", "name": "A", "index": 1, "type": "AUX" }
        ],
        "sends": [{ "sourceTrackId": "t", "destinationBusId": "a", "amount": 1.0, "preFader": true }],
        "nodes": [
            { "id": "m", "name": "M", "type": "BUS", "index": 0, "inputIds": ["a"] },
            { "id": "a", "name": "A", "type": "BUS", "index": 1 },
            { "id": "t", "name": "T", "type": "TRACK", "index": 2 }
        ],
        "tracks": [{ "id": "t", "volumeDb": -200, "notes": [{ "time": 0, "duration": 1, "pitch": 69 }] }]
    }"#;

    fn master_peak(renderer: &mut GraphRenderer, song: &SongState) -> f32 {
        let master = song.graph().main_output();
        renderer
            .output_mut(master, FRAMES)
            .unwrap()
            .iter()
            .map(|s| s.peak())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_track_reaches_master() {
        let song = song(ONE_TRACK);
        let pool = pool(4);
        let mut renderer = GraphRenderer::new(16, FRAMES, 48000.0);
        assert_eq!(renderer.bind(&song, 1, |i| song.initial_volume_db(i), &pool), 0);
        assert_eq!(pool.available(0), 2);

        let outcome = renderer.render(&song, &song.performances()[0], &timing(0.1), FRAMES);
        assert_eq!(outcome.active_notes, 1);
        assert!(master_peak(&mut renderer, &song) > 0.05);

        renderer.unbind(&pool);
        assert_eq!(pool.available(0), 4);
    }

    #[test]
    fn test_muted_track_feeds_pre_fader_send() {
        let song = song(PRE_FADER);
        let pool = pool(8);
        let mut renderer = GraphRenderer::new(16, FRAMES, 48000.0);
        renderer.bind(&song, 1, |i| song.initial_volume_db(i), &pool);

        renderer.render(&song, &song.performances()[0], &timing(0.1), FRAMES);
        // Fader at -200 dB, yet the pre-fader send still carries the track
        let track = song.graph().index_of("t").unwrap();
        assert_eq!(
            renderer.output_mut(track, FRAMES).unwrap().iter().map(|s| s.peak()).fold(0.0, f32::max),
            0.0
        );
        assert!(master_peak(&mut renderer, &song) > 0.05);
    }

    #[test]
    fn test_volume_change_reaches_fader() {
        let song = song(ONE_TRACK);
        let pool = pool(4);
        let mut renderer = GraphRenderer::new(16, FRAMES, 48000.0);
        renderer.bind(&song, 1, |i| song.initial_volume_db(i), &pool);

        let track = song.graph().index_of("t").unwrap();
        renderer.set_volume(track, -200.0, 0);
        renderer.render(&song, &song.performances()[0], &timing(0.1), FRAMES);
        assert_eq!(master_peak(&mut renderer, &song), 0.0);
    }

    #[test]
    fn test_exhausted_pool_leaves_node_silent() {
        let song = song(ONE_TRACK);
        let pool = pool(1);
        let mut renderer = GraphRenderer::new(16, FRAMES, 48000.0);
        // Master is declared first and takes the only block
        assert_eq!(renderer.bind(&song, 1, |i| song.initial_volume_db(i), &pool), 1);
        let outcome = renderer.render(&song, &song.performances()[0], &timing(0.1), FRAMES);
        assert_eq!(outcome.active_notes, 0);
        assert_eq!(master_peak(&mut renderer, &song), 0.0);
    }
}
