//! Song state: the validated, immutable form of a song document
//!
//! A [`SongState`] is built entirely on the control thread. Once built it is
//! never mutated; loading a different song builds a new one.

mod document;
mod tempo;

pub use document::{Note, PerformanceDocument, SongDocument, TrackData};
pub use tempo::{TempoMap, TempoPoint, DEFAULT_BPM};

use std::collections::HashSet;

use crate::error::{EngineResult, TopologyError};
use crate::graph::{CompiledGraph, NodeType, Topology};
use crate::types::{MAX_GAIN_DB, MIN_GAIN_DB};

/// Id of the performance synthesized for songs that declare none
pub const DEFAULT_PERFORMANCE_ID: &str = "default";

/// A performance resolved against the song graph
#[derive(Debug, Clone)]
pub struct Performance {
    pub id: String,
    pub name: String,
    /// Active flag per graph node index
    active: Box<[bool]>,
    total_notes: u32,
}

impl Performance {
    #[inline]
    pub fn is_active(&self, node: usize) -> bool {
        self.active.get(node).copied().unwrap_or(false)
    }

    /// Notes on the tracks this performance activates
    #[inline]
    pub fn total_notes(&self) -> u32 {
        self.total_notes
    }
}

/// Validated song
#[derive(Debug, Clone)]
pub struct SongState {
    id: String,
    name: String,
    duration: f64,
    tempo: TempoMap,
    graph: CompiledGraph,
    /// Notes per graph node, sorted by start; empty for non-track nodes
    notes: Box<[Box<[Note]>]>,
    max_note_duration: Box<[f64]>,
    /// Initial fader level per graph node
    volume_db: Box<[f64]>,
    performances: Box<[Performance]>,
    default_performance: usize,
    document: SongDocument,
}

impl SongState {
    /// Parse and validate a JSON song document
    pub fn from_json(json: &str, max_nodes: usize) -> EngineResult<Self> {
        let document = SongDocument::from_json(json)?;
        Ok(Self::from_document(document, max_nodes)?)
    }

    /// Validate a parsed document
    pub fn from_document(document: SongDocument, max_nodes: usize) -> Result<Self, TopologyError> {
        let topology = Topology {
            buses: document.buses.clone(),
            sends: document.sends.clone(),
            nodes: document.nodes.clone(),
        };
        let graph = CompiledGraph::compile(&topology, max_nodes)?;
        let tempo = TempoMap::from_points(&document.tempo_map)?;
        let node_count = graph.node_count();

        let mut notes: Vec<Box<[Note]>> = vec![Box::default(); node_count];
        let mut max_note_duration = vec![0.0; node_count];
        let mut volume_db: Vec<f64> = graph.nodes().iter().map(|n| n.volume_db).collect();
        let mut seen_tracks = HashSet::new();
        for track in &document.tracks {
            let index = graph
                .index_of(&track.id)
                .filter(|&i| graph.nodes()[i].kind == NodeType::Track)
                .ok_or_else(|| TopologyError::DanglingReference {
                    owner: "tracks".to_string(),
                    missing: track.id.clone(),
                })?;
            if !seen_tracks.insert(track.id.as_str()) {
                return Err(TopologyError::DuplicateId(track.id.clone()));
            }
            for note in &track.notes {
                check_note(&track.id, note)?;
            }
            let mut sorted = track.notes.clone();
            sorted.sort_by(|a, b| a.time.total_cmp(&b.time));
            max_note_duration[index] = sorted.iter().map(|n| n.duration).fold(0.0, f64::max);
            notes[index] = sorted.into_boxed_slice();
            volume_db[index] = track.volume_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        }

        let duration = match document.duration_seconds {
            Some(d) if d.is_finite() => d.max(0.0),
            _ => notes
                .iter()
                .flat_map(|n| n.iter())
                .map(Note::end)
                .fold(0.0, f64::max),
        };

        let performances = resolve_performances(&document, &graph, &notes)?;
        let default_performance = match &document.default_performance_id {
            Some(id) => performances.iter().position(|p| &p.id == id).ok_or_else(|| {
                TopologyError::UnknownPerformanceEntity {
                    performance: "defaultPerformanceId".to_string(),
                    missing: id.clone(),
                }
            })?,
            None => 0,
        };

        Ok(Self {
            id: document.id.clone(),
            name: document.name.clone(),
            duration,
            tempo,
            graph,
            notes: notes.into_boxed_slice(),
            max_note_duration: max_note_duration.into_boxed_slice(),
            volume_db: volume_db.into_boxed_slice(),
            performances,
            default_performance,
            document,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the song in seconds
    #[inline]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    #[inline]
    pub fn tempo(&self) -> &TempoMap {
        &self.tempo
    }

    #[inline]
    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    #[inline]
    pub fn notes(&self, node: usize) -> &[Note] {
        self.notes.get(node).map_or(&[][..], |n| &n[..])
    }

    #[inline]
    pub fn max_note_duration(&self, node: usize) -> f64 {
        self.max_note_duration.get(node).copied().unwrap_or(0.0)
    }

    /// Fader level a node starts at
    pub fn initial_volume_db(&self, node: usize) -> f64 {
        self.volume_db.get(node).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn performances(&self) -> &[Performance] {
        &self.performances
    }

    pub fn performance_index(&self, id: &str) -> Option<usize> {
        self.performances.iter().position(|p| p.id == id)
    }

    pub fn default_performance(&self) -> usize {
        self.default_performance
    }

    pub fn document(&self) -> &SongDocument {
        &self.document
    }

    /// Canonical pretty-printed document
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        self.document.to_json_pretty()
    }
}

fn check_note(track: &str, note: &Note) -> Result<(), TopologyError> {
    let reason = if !(note.time.is_finite() && note.time >= 0.0) {
        format!("start time {} is negative or not finite", note.time)
    } else if !(note.duration.is_finite() && note.duration > 0.0) {
        format!("duration {} is not positive", note.duration)
    } else if !(0.0..=1.0).contains(&note.velocity) {
        format!("velocity {} outside [0, 1]", note.velocity)
    } else if note.pitch > 127 {
        format!("pitch {} above 127", note.pitch)
    } else {
        return Ok(());
    };
    Err(TopologyError::InvalidNote {
        track: track.to_string(),
        reason,
    })
}

fn resolve_performances(
    document: &SongDocument,
    graph: &CompiledGraph,
    notes: &[Box<[Note]>],
) -> Result<Box<[Performance]>, TopologyError> {
    let synthesized;
    let declared: &[PerformanceDocument] = if document.performances.is_empty() {
        synthesized = [PerformanceDocument {
            id: DEFAULT_PERFORMANCE_ID.to_string(),
            name: "Default".to_string(),
            track_ids: Vec::new(),
            bus_ids: Vec::new(),
        }];
        &synthesized
    } else {
        &document.performances
    };

    let nodes = graph.nodes();
    let mut ids = HashSet::new();
    let mut performances = Vec::with_capacity(declared.len());
    for perf in declared {
        if !ids.insert(perf.id.as_str()) {
            return Err(TopologyError::DuplicatePerformance(perf.id.clone()));
        }
        let unknown = |missing: &String| TopologyError::UnknownPerformanceEntity {
            performance: perf.id.clone(),
            missing: missing.clone(),
        };

        let mut active: Vec<bool> = nodes
            .iter()
            .map(|n| match (n.kind, n.bus_type) {
                (NodeType::Track, _) => perf.track_ids.is_empty(),
                (_, Some(crate::graph::BusType::Master)) => true,
                (_, Some(_)) => perf.bus_ids.is_empty(),
                (_, None) => true,
            })
            .collect();
        for id in &perf.track_ids {
            let index = graph
                .index_of(id)
                .filter(|&i| nodes[i].kind == NodeType::Track)
                .ok_or_else(|| unknown(id))?;
            active[index] = true;
        }
        for id in &perf.bus_ids {
            let index = graph
                .index_of(id)
                .filter(|&i| nodes[i].bus_type.is_some())
                .ok_or_else(|| unknown(id))?;
            active[index] = true;
        }

        let total_notes: u32 = nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| n.kind == NodeType::Track && active[*i])
            .map(|(i, _)| notes[i].len() as u32)
            .sum();
        performances.push(Performance {
            id: perf.id.clone(),
            name: perf.name.clone(),
            active: active.into_boxed_slice(),
            total_notes,
        });
    }
    Ok(performances.into_boxed_slice())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::EngineError;

    /// Two tracks into a group, a reverb send, two performances
    pub(crate) const ARRANGED_SONG: &str = r#"{
        "id": "arranged",
        "name": "Arranged",
        "tempoMap": [{ "time": 0, "bpm": 120, "beatsPerBar": 4, "beatUnit": 4 }],
        "buses": [
            { "id": "master", "name": "Master", "index": 0, "type": "MASTER", "volumeDb": 0 },
            { "id": "group", "name": "Group", "index": 1, "type": "GROUP", "volumeDb": -2 },
            { "id": "reverb", "name": "Reverb", "index": 2, "type": "AUX", "volumeDb": -6 }
        ],
        "sends": [{ "sourceTrackId": "keys", "destinationBusId": "reverb", "amount": 0.25, "preFader": false }],
        "nodes": [
            { "id": "master", "name": "Master", "type": "BUS", "index": 0, "inputIds": ["group", "reverb"] },
            { "id": "group", "name": "Group", "type": "BUS", "index": 1, "inputIds": ["keys", "bass"] },
            { "id": "reverb", "name": "Reverb", "type": "BUS", "index": 2 },
            { "id": "keys", "name": "Keys", "type": "TRACK", "index": 3 },
            { "id": "bass", "name": "Bass", "type": "TRACK", "index": 4 }
        ],
        "tracks": [
            { "id": "keys", "volumeDb": -3, "notes": [
                { "time": 1.0, "duration": 1.0, "pitch": 64, "velocity": 0.7 },
                { "time": 0.0, "duration": 2.0, "pitch": 60, "velocity": 0.9 }
            ] },
            { "id": "bass", "notes": [{ "time": 0.0, "duration": 4.0, "pitch": 36, "velocity": 1.0 }] }
        ],
        "performances": [
            { "id": "full", "name": "Full" },
            { "id": "bass-only", "name": "Bass only", "trackIds": ["bass"], "busIds": ["group"] }
        ],
        "defaultPerformanceId": "full"
    }"#;

    fn song() -> SongState {
        SongState::from_json(ARRANGED_SONG, 64).unwrap()
    }

    #[test]
    fn test_song_resolves_tracks_and_duration() {
        let song = song();
        assert_eq!(song.id(), "arranged");
        assert_eq!(song.duration(), 4.0);
        let keys = song.graph().index_of("keys").unwrap();
        assert_eq!(song.notes(keys).len(), 2);
        assert_eq!(song.notes(keys)[0].pitch, 60, "notes are sorted by start");
        assert_eq!(song.max_note_duration(keys), 2.0);
        assert_eq!(song.initial_volume_db(keys), -3.0);
        let group = song.graph().index_of("group").unwrap();
        assert_eq!(song.initial_volume_db(group), -2.0);
    }

    #[test]
    fn test_performances_select_nodes() {
        let song = song();
        let graph = song.graph();
        let full = &song.performances()[0];
        let bass_only = &song.performances()[song.performance_index("bass-only").unwrap()];

        assert_eq!(full.total_notes(), 3);
        assert_eq!(bass_only.total_notes(), 1);
        assert!(bass_only.is_active(graph.index_of("bass").unwrap()));
        assert!(!bass_only.is_active(graph.index_of("keys").unwrap()));
        assert!(!bass_only.is_active(graph.index_of("reverb").unwrap()));
        assert!(bass_only.is_active(graph.master()));
    }

    #[test]
    fn test_document_volumes_are_clamped() {
        let mut doc = SongDocument::from_json(ARRANGED_SONG).unwrap();
        doc.tracks[0].volume_db = 1000.0;
        doc.buses[1].volume_db = -1000.0;
        let song = SongState::from_document(doc, 64).unwrap();

        let keys = song.graph().index_of("keys").unwrap();
        let group = song.graph().index_of("group").unwrap();
        assert_eq!(song.initial_volume_db(keys), MAX_GAIN_DB);
        assert_eq!(song.initial_volume_db(group), MIN_GAIN_DB);
        assert_eq!(song.graph().nodes()[group].volume_db, MIN_GAIN_DB);
    }

    #[test]
    fn test_song_without_performances_gets_default() {
        let mut doc = SongDocument::from_json(ARRANGED_SONG).unwrap();
        doc.performances.clear();
        doc.default_performance_id = None;
        let song = SongState::from_document(doc, 64).unwrap();
        assert_eq!(song.performances().len(), 1);
        assert_eq!(song.performances()[0].id, DEFAULT_PERFORMANCE_ID);
        assert_eq!(song.performances()[0].total_notes(), 3);
    }

    #[test]
    fn test_performance_with_unknown_entity_rejected() {
        let mut doc = SongDocument::from_json(ARRANGED_SONG).unwrap();
        doc.performances[1].track_ids.push("ghost".into());
        assert!(matches!(
            SongState::from_document(doc, 64),
            Err(TopologyError::UnknownPerformanceEntity { missing, .. }) if missing == "ghost"
        ));
    }

    #[test]
    fn test_invalid_note_rejected() {
        let mut doc = SongDocument::from_json(ARRANGED_SONG).unwrap();
        doc.tracks[0].notes[0].duration = 0.0;
        assert!(matches!(
            SongState::from_document(doc, 64),
            Err(TopologyError::InvalidNote { .. })
        ));
    }

    #[test]
    fn test_parse_and_validation_errors_are_distinct() {
        assert!(matches!(SongState::from_json("not json", 64), Err(EngineError::Parse(_))));
        let cyclic = ARRANGED_SONG.replace(
            r#""name": "Reverb", "type": "BUS", "index": 2 }"#,
            r#""name": "Reverb", "type": "BUS", "index": 2, "inputIds": ["master"] }"#,
        );
        assert!(matches!(
            SongState::from_json(&cyclic, 64),
            Err(EngineError::Validation(TopologyError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_canonical_json_reloads() {
        let song = song();
        let text = song.to_json().unwrap();
        let again = SongState::from_json(&text, 64).unwrap();
        assert_eq!(again.document(), song.document());
    }
}
