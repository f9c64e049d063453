//! Engine configuration
//!
//! [`EngineConfig`] carries everything fixed at engine construction: sample
//! rate and block sizes, pool classes, queue capacities, dropout thresholds
//! and the stop policy. It is read from YAML with [`load_config`] and must
//! pass [`EngineConfig::validate`] before an engine is built from it.
//!
//! ```ignore
//! let config: EngineConfig = load_config(&default_config_path("engine.yaml"));
//! config.validate()?;
//! ```

mod engine;
mod io;
mod paths;

pub use engine::{DropoutConfig, EngineConfig, PoolClassConfig, StopPolicy};
pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};
