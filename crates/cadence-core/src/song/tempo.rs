//! Tempo and time-signature map

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Tempo used when a song declares no tempo map
pub const DEFAULT_BPM: f64 = 120.0;

/// A tempo/time-signature change at a point in song time (seconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempoPoint {
    pub time: f64,
    pub bpm: f64,
    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: u32,
    #[serde(default = "default_beat_unit")]
    pub beat_unit: u32,
}

fn default_beats_per_bar() -> u32 {
    4
}

fn default_beat_unit() -> u32 {
    4
}

impl Default for TempoPoint {
    fn default() -> Self {
        Self {
            time: 0.0,
            bpm: DEFAULT_BPM,
            beats_per_bar: default_beats_per_bar(),
            beat_unit: default_beat_unit(),
        }
    }
}

/// Validated, time-sorted tempo map
///
/// Always holds at least one point and the first point sits at time zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    points: Box<[TempoPoint]>,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self {
            points: Box::new([TempoPoint::default()]),
        }
    }
}

impl TempoMap {
    /// Build a map from document points
    ///
    /// An empty list yields the default 120 BPM 4/4 map. Points must be in
    /// strictly increasing time order with positive tempo and meter. A map
    /// whose first point is later than zero is extended backwards with that
    /// point's values.
    pub fn from_points(points: &[TempoPoint]) -> Result<Self, TopologyError> {
        if points.is_empty() {
            return Ok(Self::default());
        }
        for (i, p) in points.iter().enumerate() {
            if !(p.time.is_finite() && p.time >= 0.0) {
                return Err(TopologyError::InvalidTempoMap(format!(
                    "point {} has invalid time {}",
                    i, p.time
                )));
            }
            if !(p.bpm.is_finite() && p.bpm > 0.0) {
                return Err(TopologyError::InvalidTempoMap(format!(
                    "point {} has non-positive tempo {}",
                    i, p.bpm
                )));
            }
            if p.beats_per_bar == 0 || p.beat_unit == 0 {
                return Err(TopologyError::InvalidTempoMap(format!(
                    "point {} has an empty time signature",
                    i
                )));
            }
            if i > 0 && p.time <= points[i - 1].time {
                return Err(TopologyError::InvalidTempoMap(format!(
                    "point {} at {}s is not after the previous point",
                    i, p.time
                )));
            }
        }

        let mut sorted = points.to_vec();
        if sorted[0].time > 0.0 {
            let first = TempoPoint { time: 0.0, ..sorted[0] };
            sorted.insert(0, first);
        }
        Ok(Self {
            points: sorted.into_boxed_slice(),
        })
    }

    /// Tempo point in effect at `seconds`
    ///
    /// Allocation-free; safe to call on the render thread.
    #[inline]
    pub fn at(&self, seconds: f64) -> &TempoPoint {
        let idx = self.points.partition_point(|p| p.time <= seconds);
        &self.points[idx.saturating_sub(1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(time: f64, bpm: f64, beats_per_bar: u32) -> TempoPoint {
        TempoPoint {
            time,
            bpm,
            beats_per_bar,
            beat_unit: 4,
        }
    }

    #[test]
    fn test_empty_map_defaults() {
        let map = TempoMap::from_points(&[]).unwrap();
        assert_eq!(map.at(10.0).bpm, DEFAULT_BPM);
        assert_eq!(map.at(10.0).beats_per_bar, 4);
    }

    #[test]
    fn test_lookup_between_points() {
        let map = TempoMap::from_points(&[point(0.0, 120.0, 4), point(10.0, 90.0, 3)]).unwrap();
        assert_eq!(map.at(0.0).bpm, 120.0);
        assert_eq!(map.at(9.999).bpm, 120.0);
        assert_eq!(map.at(10.0).bpm, 90.0);
        assert_eq!(map.at(100.0).beats_per_bar, 3);
    }

    #[test]
    fn test_late_first_point_extends_to_zero() {
        let map = TempoMap::from_points(&[point(2.0, 100.0, 4)]).unwrap();
        assert_eq!(map.at(0.0).bpm, 100.0);
        assert_eq!(map.at(0.0).time, 0.0);
        assert_eq!(map.at(3.0).time, 2.0);
    }

    #[test]
    fn test_invalid_maps_rejected() {
        assert!(TempoMap::from_points(&[point(0.0, 0.0, 4)]).is_err());
        assert!(TempoMap::from_points(&[point(0.0, 120.0, 0)]).is_err());
        assert!(TempoMap::from_points(&[point(5.0, 120.0, 4), point(5.0, 100.0, 4)]).is_err());
    }
}
