//! Error types for the projection engine
//!
//! Control-path operations return these errors and leave previously
//! published state untouched. The render path never returns errors; its
//! failures surface through counters and telemetry instead.

use thiserror::Error;

/// Constraint violated by a song topology
///
/// Each variant names exactly one broken rule so hosts can report it
/// without parsing strings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    /// The routing graph contains a cycle
    #[error("Routing cycle through nodes: {}", nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    /// No MASTER bus is declared
    #[error("Song has no MASTER bus")]
    MissingMaster,

    /// More than one MASTER bus is declared
    #[error("Song has {} MASTER buses ({}), exactly one is required", ids.len(), ids.join(", "))]
    MultipleMasters { ids: Vec<String> },

    /// A send targets the MASTER bus
    #[error("Send from '{source_id}' targets the MASTER bus '{destination}'")]
    SendTargetsMaster { source_id: String, destination: String },

    /// A send, edge, track or bus references an id that does not exist
    #[error("'{owner}' references unknown id '{missing}'")]
    DanglingReference { owner: String, missing: String },

    /// Two entities share an id
    #[error("Duplicate id '{0}'")]
    DuplicateId(String),

    /// Send amount outside [0, 1]
    #[error("Send from '{source_id}' to '{destination}' has amount {amount} outside [0, 1]")]
    InvalidSendAmount {
        source_id: String,
        destination: String,
        amount: f64,
    },

    /// A send originates from something that is not a TRACK node
    #[error("Send source '{0}' is not a TRACK node")]
    InvalidSendSource(String),

    /// A bus has no BUS/OUTPUT node carrying its audio
    #[error("Bus '{0}' has no graph node")]
    BusWithoutNode(String),

    /// A performance references an entity missing from the song
    #[error("Performance '{performance}' references unknown entity '{missing}'")]
    UnknownPerformanceEntity { performance: String, missing: String },

    /// Two performances share an id
    #[error("Duplicate performance id '{0}'")]
    DuplicatePerformance(String),

    /// Tempo map is empty, unsorted or contains non-positive values
    #[error("Invalid tempo map: {0}")]
    InvalidTempoMap(String),

    /// More nodes than the renderer has pre-allocated state for
    #[error("Song has {count} graph nodes, engine is configured for at most {max}")]
    TooManyNodes { count: usize, max: usize },

    /// A note with negative time, non-positive duration or out-of-range velocity
    #[error("Track '{track}' has an invalid note: {reason}")]
    InvalidNote { track: String, reason: String },
}

/// Errors returned by engine control operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine handle has not been initialized
    #[error("Engine is not initialized")]
    NotInitialized,

    /// The operation needs a loaded song
    #[error("No song is loaded")]
    NoSong,

    /// The song document is not valid JSON or does not match the schema
    #[error("Malformed song document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The song document parsed but violates a graph constraint
    #[error("Invalid song topology: {0}")]
    Validation(#[from] TopologyError),

    /// No performance with this id exists in the active song
    #[error("Unknown performance '{0}'")]
    UnknownPerformance(String),

    /// No graph node with this id exists in the active song
    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    /// The memory pool has no free block in this size class
    #[error("Memory pool exhausted (size class {size_class})")]
    PoolExhausted { size_class: usize },

    /// A bounded queue has no free slot
    #[error("Queue is full")]
    QueueFull,

    /// The transport cannot take this transition from its current state
    #[error("Transport cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    /// Configuration values are inconsistent
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_error_names_constraint() {
        let err = TopologyError::Cycle {
            nodes: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Routing cycle through nodes: a -> b -> a");

        let err = TopologyError::SendTargetsMaster {
            source_id: "drums".into(),
            destination: "master".into(),
        };
        assert!(err.to_string().contains("MASTER"));
    }

    #[test]
    fn test_validation_wraps_topology_error() {
        let err: EngineError = TopologyError::MissingMaster.into();
        assert!(matches!(err, EngineError::Validation(TopologyError::MissingMaster)));
    }
}
