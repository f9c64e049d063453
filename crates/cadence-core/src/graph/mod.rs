//! Audio graph: topology, validation, processing order and rendering
//!
//! The control path turns a [`Topology`] into a [`CompiledGraph`]: every id
//! resolved to a node index, every edge checked, the processing order fixed.
//! The render path only ever sees compiled graphs inside a published
//! snapshot, so it never looks up strings or discovers an invalid edge.

mod node;
mod render;
mod topology;

pub use node::{GainStage, NodeProcessor, ProcessContext, Processor, TrackVoices};
pub use render::{GraphRenderer, RenderOutcome};
pub use topology::{
    processing_order, validate, Bus, BusType, GraphNode, NodeType, SendConnection, Topology,
};

use std::collections::HashMap;

use crate::error::TopologyError;
use crate::types::{MAX_GAIN_DB, MIN_GAIN_DB};

/// A send feeding a bus node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendTap {
    /// Index of the source TRACK node
    pub source: usize,
    pub amount: f32,
    pub pre_fader: bool,
}

/// A node with every reference resolved to an index
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub name: String,
    pub kind: NodeType,
    /// Bus role, if a bus entity is attached to this node
    pub bus_type: Option<BusType>,
    /// Initial fader level: bus volume for bus nodes, 0 dB otherwise
    pub volume_db: f64,
    /// Direct inputs, mixed at their post-fader level
    pub inputs: Box<[usize]>,
    /// Sends arriving at this node
    pub sends: Box<[SendTap]>,
    /// Some send taps this track before its fader
    pub feeds_pre_fader: bool,
}

/// Validated graph in processing order
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    nodes: Box<[CompiledNode]>,
    order: Box<[usize]>,
    master: usize,
    main_output: usize,
    index_by_id: HashMap<String, usize>,
}

impl CompiledGraph {
    /// Validate a topology and resolve it for rendering
    ///
    /// `max_nodes` bounds the per-node state the renderer pre-allocates.
    pub fn compile(topology: &Topology, max_nodes: usize) -> Result<Self, TopologyError> {
        if topology.nodes.len() > max_nodes {
            return Err(TopologyError::TooManyNodes {
                count: topology.nodes.len(),
                max: max_nodes,
            });
        }
        validate(topology)?;

        let edges = topology::resolve_edges(topology);
        let order = topology::order_from_inputs(topology, &edges.predecessors())?;

        let mut nodes: Vec<CompiledNode> = topology
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let bus = topology.buses.iter().find(|b| b.id == node.id);
                CompiledNode {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    kind: node.node_type,
                    bus_type: bus.map(|b| b.bus_type),
                    volume_db: bus.map_or(0.0, |b| b.volume_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB)),
                    inputs: edges.direct[i].clone().into_boxed_slice(),
                    sends: edges.sends[i]
                        .iter()
                        .map(|&(source, send_idx)| {
                            let send = &topology.sends[send_idx];
                            SendTap {
                                source,
                                amount: send.amount as f32,
                                pre_fader: send.pre_fader,
                            }
                        })
                        .collect(),
                    feeds_pre_fader: false,
                }
            })
            .collect();
        for send in &topology.sends {
            if !send.pre_fader {
                continue;
            }
            if let Some(node) = nodes.iter_mut().find(|n| n.id == send.source_track_id) {
                node.feeds_pre_fader = true;
            }
        }

        let index_by_id: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let master = nodes
            .iter()
            .position(|n| n.bus_type == Some(BusType::Master))
            .ok_or(TopologyError::MissingMaster)?;
        // Master may hand its signal on to a dedicated OUTPUT node
        let main_output = order
            .iter()
            .copied()
            .find(|&i| nodes[i].kind == NodeType::Output && nodes[i].inputs.contains(&master))
            .unwrap_or(master);

        Ok(Self {
            nodes: nodes.into_boxed_slice(),
            order: order.into_boxed_slice(),
            master,
            main_output,
            index_by_id,
        })
    }

    #[inline]
    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node indices in processing order
    #[inline]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    #[inline]
    pub fn master(&self) -> usize {
        self.master
    }

    /// Node whose buffer is delivered to the host
    #[inline]
    pub fn main_output(&self) -> usize {
        self.main_output
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }
}
