//! Cross-thread queues
//!
//! - [`command`]: control → render, SPSC, explicit backpressure
//! - [`ring`]: bounded MPSC ring, drops and counts on overflow
//! - [`telemetry`]: render → control events built on the MPSC ring

pub mod command;
pub mod ring;
pub mod telemetry;

pub use command::{command_channel, CommandSender, EngineCommand};
pub use ring::{event_queue, EventReceiver, EventSender};
pub use telemetry::{
    telemetry_channel, ParameterChangeEvent, ParameterKey, TelemetryConsumer, TelemetryEvent,
    TelemetryProducer, TelemetryRecord,
};
