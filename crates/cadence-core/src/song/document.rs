//! Song document: the JSON form songs are loaded from

use serde::{Deserialize, Serialize};

use super::tempo::TempoPoint;
use crate::graph::{Bus, GraphNode, SendConnection};

/// A note on a track, in song seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub time: f64,
    pub duration: f64,
    pub pitch: u8,
    #[serde(default = "default_velocity")]
    pub velocity: f32,
}

fn default_velocity() -> f32 {
    0.8
}

impl Note {
    #[inline]
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }
}

/// Musical content and fader level of a TRACK node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    /// Id of the TRACK node this data belongs to
    pub id: String,
    #[serde(default)]
    pub volume_db: f64,
    #[serde(default)]
    pub notes: Vec<Note>,
}

/// A named arrangement: which tracks and buses are active
///
/// An empty `trackIds` (or `busIds`) list activates every track (or bus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub track_ids: Vec<String>,
    #[serde(default)]
    pub bus_ids: Vec<String>,
}

/// Complete song document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub tempo_map: Vec<TempoPoint>,
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub sends: Vec<SendConnection>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub tracks: Vec<TrackData>,
    #[serde(default)]
    pub performances: Vec<PerformanceDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_performance_id: Option<String>,
}

impl SongDocument {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Canonical pretty-printed JSON
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BusType, NodeType};

    const SONG: &str = r#"{
        "id": "song-1",
        "name": "Test Song",
        "tempoMap": [{ "time": 0, "bpm": 96, "beatsPerBar": 3 }],
        "buses": [{ "id": "master", "name": "Master", "index": 0, "type": "MASTER", "volumeDb": -3 }],
        "nodes": [
            { "id": "master", "name": "Master", "type": "BUS", "index": 0, "inputIds": ["piano"] },
            { "id": "piano", "name": "Piano", "type": "TRACK", "index": 1 }
        ],
        "tracks": [{ "id": "piano", "notes": [{ "time": 0, "duration": 0.5, "pitch": 60 }] }]
    }"#;

    #[test]
    fn test_parse_minimal_song() {
        let doc = SongDocument::from_json(SONG).unwrap();
        assert_eq!(doc.id, "song-1");
        assert_eq!(doc.buses[0].bus_type, BusType::Master);
        assert_eq!(doc.buses[0].volume_db, -3.0);
        assert_eq!(doc.nodes[1].node_type, NodeType::Track);
        assert!(doc.nodes[1].output_ids.is_empty());
        assert_eq!(doc.tempo_map[0].beats_per_bar, 3);
        assert_eq!(doc.tempo_map[0].beat_unit, 4);
        assert_eq!(doc.tracks[0].notes[0].velocity, 0.8);
        assert!(doc.performances.is_empty());
    }

    #[test]
    fn test_pretty_json_reparses_identically() {
        let doc = SongDocument::from_json(SONG).unwrap();
        let text = doc.to_json_pretty().unwrap();
        assert!(text.contains("\"sourceTrackId\"") || doc.sends.is_empty());
        assert!(!text.contains("durationSeconds"));
        assert_eq!(SongDocument::from_json(&text).unwrap(), doc);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(SongDocument::from_json("{ \"id\": ").is_err());
        assert!(SongDocument::from_json(r#"{ "name": "no id" }"#).is_err());
    }
}
