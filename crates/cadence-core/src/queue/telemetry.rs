//! Render → control telemetry
//!
//! The render thread pushes compact, `Copy` events that carry indices rather
//! than strings. The control thread drains them, resolves indices to ids and
//! writes one JSON object per line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::ring::{event_queue, EventReceiver, EventSender};
use crate::engine::LoadSignal;

/// Parameter a change event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKey {
    MasterGain,
    TempoMultiplier,
    /// Fader of the node at this index in the graph of `graph_generation`
    NodeVolume { node: u32, graph_generation: u64 },
}

/// A parameter observed changing on the render thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterChangeEvent {
    pub event_id: u64,
    pub parameter: ParameterKey,
    pub previous_value: f64,
    pub new_value: f64,
    pub is_undo: bool,
    pub duration_ms: u32,
    pub timestamp_ms: u64,
}

impl ParameterChangeEvent {
    #[inline]
    pub fn delta(&self) -> f64 {
        (self.new_value - self.previous_value).abs()
    }
}

/// Event produced on the render thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryEvent {
    ParameterChange(ParameterChangeEvent),
    /// Dropout prevention moved the load level
    LoadSignal {
        event_id: u64,
        signal: LoadSignal,
        level: u8,
        timestamp_ms: u64,
    },
    /// A block took longer than its real-time budget
    DeadlineOverrun {
        event_id: u64,
        elapsed_us: u64,
        budget_us: u64,
        timestamp_ms: u64,
    },
}

impl TelemetryEvent {
    pub fn event_id(&self) -> u64 {
        match self {
            TelemetryEvent::ParameterChange(e) => e.event_id,
            TelemetryEvent::LoadSignal { event_id, .. }
            | TelemetryEvent::DeadlineOverrun { event_id, .. } => *event_id,
        }
    }
}

/// Serialized form of a telemetry event, one per output line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    ParameterChange {
        event_id: u64,
        parameter_id: String,
        previous_value: f64,
        new_value: f64,
        delta: f64,
        is_undo: bool,
        duration_ms: u32,
        timestamp_ms: u64,
    },
    LoadSignal {
        event_id: u64,
        signal: &'static str,
        level: u8,
        timestamp_ms: u64,
    },
    DeadlineOverrun {
        event_id: u64,
        elapsed_us: u64,
        budget_us: u64,
        timestamp_ms: u64,
    },
}

impl TelemetryRecord {
    /// Convert an event, naming parameters with `parameter_id`
    pub fn from_event(event: &TelemetryEvent, parameter_id: impl FnOnce(ParameterKey) -> String) -> Self {
        match *event {
            TelemetryEvent::ParameterChange(e) => TelemetryRecord::ParameterChange {
                event_id: e.event_id,
                parameter_id: parameter_id(e.parameter),
                previous_value: e.previous_value,
                new_value: e.new_value,
                delta: e.delta(),
                is_undo: e.is_undo,
                duration_ms: e.duration_ms,
                timestamp_ms: e.timestamp_ms,
            },
            TelemetryEvent::LoadSignal {
                event_id,
                signal,
                level,
                timestamp_ms,
            } => TelemetryRecord::LoadSignal {
                event_id,
                signal: signal.name(),
                level,
                timestamp_ms,
            },
            TelemetryEvent::DeadlineOverrun {
                event_id,
                elapsed_us,
                budget_us,
                timestamp_ms,
            } => TelemetryRecord::DeadlineOverrun {
                event_id,
                elapsed_us,
                budget_us,
                timestamp_ms,
            },
        }
    }

    /// Single-line JSON
    pub fn to_json_line(&self) -> String {
        // Only plain numbers, bools and strings: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Render-side handle for emitting telemetry
///
/// Cloneable so several render-side producers can share one queue; event ids
/// come from a shared counter and are unique across all clones.
#[derive(Clone)]
pub struct TelemetryProducer {
    sender: EventSender<TelemetryEvent>,
    next_id: Arc<AtomicU64>,
    epoch: Instant,
}

impl TelemetryProducer {
    #[inline]
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Milliseconds since the queue was created
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Push a parameter change; `false` if the queue was full
    pub fn parameter_change(
        &self,
        parameter: ParameterKey,
        previous_value: f64,
        new_value: f64,
        is_undo: bool,
        duration_ms: u32,
    ) -> bool {
        self.sender
            .push(TelemetryEvent::ParameterChange(ParameterChangeEvent {
                event_id: self.next_id(),
                parameter,
                previous_value,
                new_value,
                is_undo,
                duration_ms,
                timestamp_ms: self.now_ms(),
            }))
    }

    pub fn load_signal(&self, signal: LoadSignal, level: u8) -> bool {
        self.sender.push(TelemetryEvent::LoadSignal {
            event_id: self.next_id(),
            signal,
            level,
            timestamp_ms: self.now_ms(),
        })
    }

    pub fn deadline_overrun(&self, elapsed_us: u64, budget_us: u64) -> bool {
        self.sender.push(TelemetryEvent::DeadlineOverrun {
            event_id: self.next_id(),
            elapsed_us,
            budget_us,
            timestamp_ms: self.now_ms(),
        })
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.sender.dropped()
    }
}

/// Control-side end of the telemetry queue
pub struct TelemetryConsumer {
    receiver: EventReceiver<TelemetryEvent>,
}

impl TelemetryConsumer {
    /// Drain up to `max_count` events
    pub fn drain(&mut self, max_count: usize) -> Vec<TelemetryEvent> {
        self.receiver.pop(max_count)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.receiver.dropped()
    }
}

/// Create the telemetry queue
pub fn telemetry_channel(capacity: usize) -> (TelemetryProducer, TelemetryConsumer) {
    let (sender, receiver) = event_queue(capacity);
    (
        TelemetryProducer {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
            epoch: Instant::now(),
        },
        TelemetryConsumer { receiver },
    )
}
