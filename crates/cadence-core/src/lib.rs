//! Cadence Core - Real-time song projection engine
//!
//! Loads song documents (tracks, buses, sends, performances), validates them
//! into immutable snapshots and renders them block by block on a real-time
//! thread. Control and render threads communicate only through published
//! snapshots, atomics and bounded lock-free queues.

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod host;
pub mod pool;
pub mod queue;
pub mod song;
pub mod types;

pub use engine::{EngineController, EngineRenderer, RenderStats, Transport, TransportState};
pub use error::{EngineError, EngineResult, TopologyError};
pub use host::EngineHandle;
pub use types::*;
