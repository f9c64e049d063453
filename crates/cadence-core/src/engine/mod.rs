//! Projection engine
//!
//! The engine is split into two halves that share state only through atomics
//! and published snapshots:
//!
//! - [`EngineController`] runs on the control thread. It parses and validates
//!   songs, publishes snapshots and writes parameters.
//! - [`EngineRenderer`] runs on the audio thread. Its `process` never
//!   allocates, blocks or fails.
//!
//! ```ignore
//! let (mut controller, mut renderer) = EngineController::new(EngineConfig::default())?;
//! controller.load_song_from_json(&json)?;
//! controller.play(0.0);
//!
//! // audio thread
//! renderer.process(&mut [&mut left, &mut right], 2, 512);
//! ```

mod controller;
mod dropout;
pub(crate) mod gc;
mod params;
mod renderer;
mod snapshot;
mod stats;
mod transport;

pub use controller::{EngineController, MAX_TEMPO_MULTIPLIER, MIN_TEMPO_MULTIPLIER};
pub use dropout::{DropoutMonitor, LoadBand, LoadSignal};
pub use params::{ParamCell, ParameterChange};
pub use renderer::EngineRenderer;
pub use snapshot::{LoadedSong, Snapshot};
pub use stats::{CountersSnapshot, RenderStats};
pub use transport::{Transport, TransportState};
