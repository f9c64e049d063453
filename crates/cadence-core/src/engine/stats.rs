//! Render statistics and counters
//!
//! [`StatsCell`] is a single-slot seqlock: the renderer overwrites it once per
//! block and readers retry until they see a consistent copy. Nothing is
//! queued; a reader only ever sees the latest completed block.
//!
//! [`EngineCounters`] are monotonic counters the renderer bumps with relaxed
//! atomics.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Reader spins before it starts yielding to the writer
const SPIN_ATTEMPTS: usize = 64;

/// Statistics of the most recently completed block
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderStats {
    /// Notes on the tracks of the active performance
    pub total_notes: u32,
    /// Voices that sounded during the block
    pub active_notes: u32,
    /// Transport position at the end of the block, in seconds
    pub position: f64,
    /// Effective tempo (tempo map × multiplier) in BPM
    pub tempo: f64,
    pub beats_per_bar: u32,
}

#[derive(Debug, Default)]
pub struct StatsCell {
    seq: AtomicU64,
    total_notes: AtomicU32,
    active_notes: AtomicU32,
    position: AtomicU64,
    tempo: AtomicU64,
    beats_per_bar: AtomicU32,
}

impl StatsCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot; single writer only
    pub fn publish(&self, stats: &RenderStats) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.total_notes.store(stats.total_notes, Ordering::Relaxed);
        self.active_notes.store(stats.active_notes, Ordering::Relaxed);
        self.position.store(stats.position.to_bits(), Ordering::Relaxed);
        self.tempo.store(stats.tempo.to_bits(), Ordering::Relaxed);
        self.beats_per_bar.store(stats.beats_per_bar, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Latest consistent statistics
    ///
    /// Retries while a publish is in progress; never blocks the writer.
    pub fn read(&self) -> RenderStats {
        let mut attempts = 0;
        loop {
            let before = self.seq.load(Ordering::Acquire);
            let stats = RenderStats {
                total_notes: self.total_notes.load(Ordering::Relaxed),
                active_notes: self.active_notes.load(Ordering::Relaxed),
                position: f64::from_bits(self.position.load(Ordering::Relaxed)),
                tempo: f64::from_bits(self.tempo.load(Ordering::Relaxed)),
                beats_per_bar: self.beats_per_bar.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after && before % 2 == 0 {
                return stats;
            }
            attempts += 1;
            if attempts < SPIN_ATTEMPTS {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Render-side counters, readable from any thread
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub blocks_rendered: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub deadline_overruns: AtomicU64,
    pub commands_applied: AtomicU64,
    pub load_level: AtomicU8,
    /// `f64` bits of the mean cost / budget ratio over the dropout window
    pub average_load: AtomicU64,
    /// `f64` bits of the largest cost / budget ratio in the dropout window
    pub peak_load: AtomicU64,
}

/// Copy of [`EngineCounters`] plus the telemetry drop count
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CountersSnapshot {
    pub blocks_rendered: u64,
    pub telemetry_dropped: u64,
    pub pool_exhausted: u64,
    pub deadline_overruns: u64,
    pub commands_applied: u64,
    pub load_level: u8,
    pub average_load: f64,
    pub peak_load: f64,
}

impl EngineCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Store the dropout window summary; single writer only
    pub fn record_load(&self, average: f64, peak: f64) {
        self.average_load.store(average.to_bits(), Ordering::Relaxed);
        self.peak_load.store(peak.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, telemetry_dropped: u64) -> CountersSnapshot {
        CountersSnapshot {
            blocks_rendered: self.blocks_rendered.load(Ordering::Relaxed),
            telemetry_dropped,
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            deadline_overruns: self.deadline_overruns.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            load_level: self.load_level.load(Ordering::Relaxed),
            average_load: f64::from_bits(self.average_load.load(Ordering::Relaxed)),
            peak_load: f64::from_bits(self.peak_load.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_then_read() {
        let cell = StatsCell::new();
        assert_eq!(cell.read(), RenderStats::default());
        let stats = RenderStats {
            total_notes: 12,
            active_notes: 3,
            position: 1.25,
            tempo: 128.0,
            beats_per_bar: 4,
        };
        cell.publish(&stats);
        assert_eq!(cell.read(), stats);
    }

    #[test]
    fn test_counters_snapshot_carries_load_summary() {
        let counters = EngineCounters::default();
        assert_eq!(counters.snapshot(0).average_load, 0.0);

        counters.record_load(0.25, 0.8);
        EngineCounters::bump(&counters.blocks_rendered);
        let snapshot = counters.snapshot(3);
        assert_eq!(snapshot.average_load, 0.25);
        assert_eq!(snapshot.peak_load, 0.8);
        assert_eq!(snapshot.blocks_rendered, 1);
        assert_eq!(snapshot.telemetry_dropped, 3);
    }

    #[test]
    fn test_reader_never_sees_torn_stats() {
        let cell = StatsCell::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20_000u32 {
                    // Every field derived from i, so a torn read is detectable
                    cell.publish(&RenderStats {
                        total_notes: i,
                        active_notes: i,
                        position: i as f64,
                        tempo: i as f64,
                        beats_per_bar: i,
                    });
                }
            });
            for _ in 0..20_000 {
                let stats = cell.read();
                assert_eq!(stats.total_notes, stats.active_notes);
                assert_eq!(stats.position, stats.total_notes as f64);
                assert_eq!(stats.tempo, stats.position);
            }
        });
    }
}
