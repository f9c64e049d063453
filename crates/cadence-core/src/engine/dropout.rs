//! Dropout prevention
//!
//! Watches how much of each block's real-time budget rendering consumed and
//! asks for load reduction before deadlines are actually missed. The monitor
//! is advisory: it only returns signals, and the renderer applies them from
//! the next block on.
//!
//! Hysteresis uses different run lengths for the two directions
//! (`reduce_after` ≠ `restore_after`), so load does not flap between levels.

use std::time::Duration;

use crate::config::DropoutConfig;

/// Headroom band of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBand {
    Ample,
    Tight,
    OverBudget,
}

/// Advice emitted by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSignal {
    /// Render less: move one load level down in quality
    Reduce,
    /// Headroom is back: move one load level up in quality
    Restore,
}

impl LoadSignal {
    pub fn name(&self) -> &'static str {
        match self {
            LoadSignal::Reduce => "reduce",
            LoadSignal::Restore => "restore",
        }
    }
}

/// Rolling block-cost monitor
#[derive(Debug)]
pub struct DropoutMonitor {
    /// Recent cost / budget ratios, used as a ring
    window: Box<[f32]>,
    next: usize,
    filled: usize,
    reduce_after: usize,
    restore_after: usize,
    ample_ratio: f64,
    over_budget_ratio: f64,
    consecutive_over: usize,
    consecutive_ample: usize,
    level: u8,
    max_level: u8,
}

impl DropoutMonitor {
    pub fn new(config: &DropoutConfig) -> Self {
        Self {
            window: vec![0.0; config.window.max(1)].into_boxed_slice(),
            next: 0,
            filled: 0,
            reduce_after: config.reduce_after,
            restore_after: config.restore_after,
            ample_ratio: config.ample_ratio,
            over_budget_ratio: config.over_budget_ratio,
            consecutive_over: 0,
            consecutive_ample: 0,
            level: 0,
            max_level: config.max_level,
        }
    }

    /// Band for a cost / budget ratio
    pub fn classify(&self, ratio: f64) -> LoadBand {
        if ratio > self.over_budget_ratio {
            LoadBand::OverBudget
        } else if ratio <= self.ample_ratio {
            LoadBand::Ample
        } else {
            LoadBand::Tight
        }
    }

    /// Record one block and return a signal if a run just completed
    ///
    /// A zero budget counts as over budget.
    pub fn observe(&mut self, cost: Duration, budget: Duration) -> Option<LoadSignal> {
        let ratio = if budget.is_zero() {
            f64::INFINITY
        } else {
            cost.as_secs_f64() / budget.as_secs_f64()
        };
        self.observe_ratio(ratio)
    }

    /// Same as [`observe`](Self::observe) with a precomputed ratio
    pub fn observe_ratio(&mut self, ratio: f64) -> Option<LoadSignal> {
        self.window[self.next] = ratio.min(f32::MAX as f64) as f32;
        self.next = (self.next + 1) % self.window.len();
        self.filled = (self.filled + 1).min(self.window.len());

        match self.classify(ratio) {
            LoadBand::OverBudget => {
                self.consecutive_ample = 0;
                self.consecutive_over += 1;
                if self.consecutive_over == self.reduce_after {
                    self.consecutive_over = 0;
                    if self.level < self.max_level {
                        self.level += 1;
                        return Some(LoadSignal::Reduce);
                    }
                }
            }
            LoadBand::Ample => {
                self.consecutive_over = 0;
                self.consecutive_ample += 1;
                if self.consecutive_ample == self.restore_after {
                    self.consecutive_ample = 0;
                    if self.level > 0 {
                        self.level -= 1;
                        return Some(LoadSignal::Restore);
                    }
                }
            }
            LoadBand::Tight => {
                self.consecutive_over = 0;
                self.consecutive_ample = 0;
            }
        }
        None
    }

    /// Current load level; 0 is full quality
    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Force the level, clearing any partial run
    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(self.max_level);
        self.consecutive_over = 0;
        self.consecutive_ample = 0;
    }

    /// Forget history and return to full quality
    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.next = 0;
        self.filled = 0;
        self.set_level(0);
    }

    /// Mean cost / budget ratio over the window
    pub fn average_load(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.window[..self.filled].iter().map(|&r| r as f64).sum::<f64>() / self.filled as f64
    }

    /// Largest cost / budget ratio in the window
    pub fn peak_load(&self) -> f64 {
        self.window[..self.filled]
            .iter()
            .fold(0.0f64, |peak, &r| peak.max(r as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVER: f64 = 0.95;
    const TIGHT: f64 = 0.7;
    const AMPLE: f64 = 0.2;

    fn monitor(reduce_after: usize, restore_after: usize) -> DropoutMonitor {
        DropoutMonitor::new(&DropoutConfig {
            reduce_after,
            restore_after,
            ..DropoutConfig::default()
        })
    }

    #[test]
    fn test_classify_bands() {
        let m = monitor(4, 8);
        assert_eq!(m.classify(OVER), LoadBand::OverBudget);
        assert_eq!(m.classify(TIGHT), LoadBand::Tight);
        assert_eq!(m.classify(AMPLE), LoadBand::Ample);
        assert_eq!(m.classify(0.5), LoadBand::Ample);
    }

    #[test]
    fn test_reduce_exactly_at_kth_over_budget_block() {
        let mut m = monitor(4, 8);
        for i in 1..=3 {
            assert_eq!(m.observe_ratio(OVER), None, "no signal at block {}", i);
        }
        assert_eq!(m.observe_ratio(OVER), Some(LoadSignal::Reduce));
        assert_eq!(m.level(), 1);
        // The run restarts: the next three are quiet again
        for _ in 0..3 {
            assert_eq!(m.observe_ratio(OVER), None);
        }
    }

    #[test]
    fn test_restore_exactly_at_mth_ample_block() {
        let mut m = monitor(2, 5);
        m.observe_ratio(OVER);
        assert_eq!(m.observe_ratio(OVER), Some(LoadSignal::Reduce));
        for i in 1..=4 {
            assert_eq!(m.observe_ratio(AMPLE), None, "no signal at block {}", i);
        }
        assert_eq!(m.observe_ratio(AMPLE), Some(LoadSignal::Restore));
        assert_eq!(m.level(), 0);
    }

    #[test]
    fn test_no_restore_at_full_quality() {
        let mut m = monitor(2, 3);
        for _ in 0..10 {
            assert_eq!(m.observe_ratio(AMPLE), None);
        }
    }

    #[test]
    fn test_interrupted_runs_do_not_signal() {
        let mut m = monitor(3, 5);
        for _ in 0..10 {
            assert_eq!(m.observe_ratio(OVER), None);
            assert_eq!(m.observe_ratio(OVER), None);
            assert_eq!(m.observe_ratio(TIGHT), None);
        }
    }

    #[test]
    fn test_level_saturates() {
        let mut m = DropoutMonitor::new(&DropoutConfig {
            reduce_after: 1,
            restore_after: 2,
            max_level: 2,
            ..DropoutConfig::default()
        });
        assert_eq!(m.observe_ratio(OVER), Some(LoadSignal::Reduce));
        assert_eq!(m.observe_ratio(OVER), Some(LoadSignal::Reduce));
        assert_eq!(m.observe_ratio(OVER), None);
        assert_eq!(m.level(), 2);
    }

    #[test]
    fn test_window_statistics() {
        let mut m = monitor(4, 8);
        assert_eq!(m.average_load(), 0.0);
        m.observe(Duration::from_millis(1), Duration::from_millis(4));
        m.observe(Duration::from_millis(3), Duration::from_millis(4));
        assert!((m.average_load() - 0.5).abs() < 1e-6);
        assert!((m.peak_load() - 0.75).abs() < 1e-6);
        assert_eq!(m.classify(f64::INFINITY), LoadBand::OverBudget);
    }
}
