//! Published engine state
//!
//! The control thread builds a [`Snapshot`] completely, wraps it in a
//! `basedrop::Shared` and swaps it into [`EngineShared::snapshot`]. The
//! renderer takes one reference at the start of each block and holds it to
//! the end, so a block never mixes two snapshots. Replaced snapshots are
//! reclaimed by the collector thread once the last reference is gone.

use std::sync::Arc;

use basedrop::{Shared, SharedCell};

use super::gc::gc_handle;
use super::params::ParamCell;
use super::stats::{EngineCounters, StatsCell};
use super::transport::TransportCell;
use crate::song::{Performance, SongState};

/// A validated song plus its live fader parameters
///
/// Shared by every snapshot published while the song stays loaded, so
/// switching performances keeps fader positions.
#[derive(Debug)]
pub struct LoadedSong {
    pub state: SongState,
    /// Unique per load or reroute; the renderer rebinds node state when it changes
    pub generation: u64,
    /// Fader level each node is bound at
    baseline_db: Box<[f64]>,
    node_volume_db: Box<[ParamCell]>,
}

impl LoadedSong {
    pub fn new(state: SongState, generation: u64) -> Self {
        let baseline = (0..state.graph().node_count())
            .map(|i| state.initial_volume_db(i))
            .collect();
        Self::with_baseline(state, generation, baseline)
    }

    /// Successor of `previous` with a new routing graph
    ///
    /// Nodes whose id survives keep their current fader level; new nodes
    /// start at their document volume.
    pub fn rerouted(state: SongState, generation: u64, previous: &LoadedSong) -> Self {
        let old_graph = previous.state.graph();
        let baseline = state
            .graph()
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, node)| {
                old_graph
                    .index_of(&node.id)
                    .and_then(|old| previous.node_volume(old))
                    .map_or_else(|| state.initial_volume_db(i), ParamCell::load)
            })
            .collect();
        Self::with_baseline(state, generation, baseline)
    }

    fn with_baseline(state: SongState, generation: u64, baseline_db: Box<[f64]>) -> Self {
        let node_volume_db = baseline_db.iter().map(|&db| ParamCell::new(db)).collect();
        Self {
            state,
            generation,
            baseline_db,
            node_volume_db,
        }
    }

    #[inline]
    pub fn node_volume(&self, node: usize) -> Option<&ParamCell> {
        self.node_volume_db.get(node)
    }

    /// Level a node's fader is bound at before any control change
    pub fn baseline_volume_db(&self, node: usize) -> f64 {
        self.baseline_db.get(node).copied().unwrap_or(0.0)
    }
}

/// Everything the renderer reads for one block
#[derive(Debug)]
pub struct Snapshot {
    /// Increases with every publication
    pub generation: u64,
    pub song: Option<Arc<LoadedSong>>,
    /// Index of the active performance within `song`
    pub performance: usize,
}

impl Snapshot {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            song: None,
            performance: 0,
        }
    }

    /// The active song and performance, if a song is loaded
    pub fn active(&self) -> Option<(&LoadedSong, &Performance)> {
        let song = self.song.as_deref()?;
        let performance = song.state.performances().get(self.performance)?;
        Some((song, performance))
    }
}

/// State shared between the controller and the renderer
pub struct EngineShared {
    pub snapshot: SharedCell<Snapshot>,
    pub transport: TransportCell,
    pub master_gain_db: ParamCell,
    pub tempo_multiplier: ParamCell,
    pub stats: StatsCell,
    pub counters: EngineCounters,
}

impl EngineShared {
    pub fn new() -> Self {
        Self {
            snapshot: SharedCell::new(Shared::new(&gc_handle(), Snapshot::empty(0))),
            transport: TransportCell::new(),
            master_gain_db: ParamCell::new(0.0),
            tempo_multiplier: ParamCell::new(1.0),
            stats: StatsCell::new(),
            counters: EngineCounters::default(),
        }
    }
}

impl Default for EngineShared {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::tests::ARRANGED_SONG;

    #[test]
    fn test_swap_is_seen_by_new_readers_only() {
        let shared = EngineShared::new();
        let before = shared.snapshot.get();
        assert!(before.song.is_none());

        let song = SongState::from_json(ARRANGED_SONG, 64).unwrap();
        let loaded = Arc::new(LoadedSong::new(song, 1));
        shared.snapshot.set(Shared::new(
            &gc_handle(),
            Snapshot {
                generation: 1,
                song: Some(loaded),
                performance: 1,
            },
        ));

        // A reader holding the old snapshot keeps seeing it whole
        assert!(before.song.is_none());
        let after = shared.snapshot.get();
        let (song, performance) = after.active().unwrap();
        assert_eq!(song.state.id(), "arranged");
        assert_eq!(performance.id, "bass-only");
    }

    #[test]
    fn test_loaded_song_seeds_fader_params() {
        let song = SongState::from_json(ARRANGED_SONG, 64).unwrap();
        let keys = song.graph().index_of("keys").unwrap();
        let loaded = LoadedSong::new(song, 3);
        assert_eq!(loaded.node_volume(keys).unwrap().load(), -3.0);
        assert!(loaded.node_volume(99).is_none());
    }
}
