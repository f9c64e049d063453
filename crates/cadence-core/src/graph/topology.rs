//! Routing topology: buses, graph nodes and send connections
//!
//! These are the serialized shapes stored in song documents. A topology is
//! plain data until [`validate`] and [`processing_order`] have accepted it;
//! [`super::CompiledGraph`] is the resolved, index-based form the renderer uses.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Role of a bus in the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BusType {
    Master,
    Aux,
    Group,
    Output,
}

/// Kind of processing node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Track,
    Bus,
    Output,
}

/// A mix bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bus {
    pub id: String,
    pub name: String,
    pub index: u32,
    #[serde(rename = "type")]
    pub bus_type: BusType,
    #[serde(default)]
    pub volume_db: f64,
}

/// A processing node and its declared edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub index: u32,
    #[serde(default)]
    pub input_ids: Vec<String>,
    #[serde(default)]
    pub output_ids: Vec<String>,
}

/// Auxiliary feed from a track into a bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConnection {
    pub source_track_id: String,
    pub destination_bus_id: String,
    pub amount: f64,
    #[serde(default)]
    pub pre_fader: bool,
}

/// Buses, nodes and sends of one song
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub sends: Vec<SendConnection>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
}

impl Topology {
    /// The MASTER bus, if exactly one exists
    pub fn master_bus(&self) -> Option<&Bus> {
        let mut masters = self.buses.iter().filter(|b| b.bus_type == BusType::Master);
        match (masters.next(), masters.next()) {
            (Some(master), None) => Some(master),
            _ => None,
        }
    }
}

/// Check every structural constraint of a topology
///
/// Checks, in order: unique ids, exactly one MASTER bus, every bus backed by
/// a node, no dangling edge or send references, send sources are tracks,
/// send amounts in [0, 1], no send into MASTER, and acyclicity.
pub fn validate(topology: &Topology) -> Result<(), TopologyError> {
    let mut node_ids = HashSet::with_capacity(topology.nodes.len());
    for node in &topology.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(TopologyError::DuplicateId(node.id.clone()));
        }
    }
    let mut bus_ids = HashSet::with_capacity(topology.buses.len());
    for bus in &topology.buses {
        if !bus_ids.insert(bus.id.as_str()) {
            return Err(TopologyError::DuplicateId(bus.id.clone()));
        }
    }

    let masters: Vec<&Bus> = topology
        .buses
        .iter()
        .filter(|b| b.bus_type == BusType::Master)
        .collect();
    match masters.len() {
        0 => return Err(TopologyError::MissingMaster),
        1 => {}
        _ => {
            return Err(TopologyError::MultipleMasters {
                ids: masters.iter().map(|b| b.id.clone()).collect(),
            })
        }
    }
    let master_id = masters[0].id.as_str();

    let nodes_by_id: HashMap<&str, &GraphNode> =
        topology.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    for bus in &topology.buses {
        match nodes_by_id.get(bus.id.as_str()) {
            Some(node) if node.node_type != NodeType::Track => {}
            _ => return Err(TopologyError::BusWithoutNode(bus.id.clone())),
        }
    }
    if let Some(master_node) = nodes_by_id.get(master_id) {
        if master_node.node_type != NodeType::Bus {
            return Err(TopologyError::BusWithoutNode(master_id.to_string()));
        }
    }
    for node in &topology.nodes {
        if node.node_type == NodeType::Bus && !bus_ids.contains(node.id.as_str()) {
            return Err(TopologyError::DanglingReference {
                owner: node.id.clone(),
                missing: node.id.clone(),
            });
        }
        for edge in node.input_ids.iter().chain(node.output_ids.iter()) {
            if !nodes_by_id.contains_key(edge.as_str()) {
                return Err(TopologyError::DanglingReference {
                    owner: node.id.clone(),
                    missing: edge.clone(),
                });
            }
        }
    }

    for send in &topology.sends {
        let source = nodes_by_id.get(send.source_track_id.as_str()).ok_or_else(|| {
            TopologyError::DanglingReference {
                owner: format!("send to '{}'", send.destination_bus_id),
                missing: send.source_track_id.clone(),
            }
        })?;
        if source.node_type != NodeType::Track {
            return Err(TopologyError::InvalidSendSource(source.id.clone()));
        }
        if !bus_ids.contains(send.destination_bus_id.as_str()) {
            return Err(TopologyError::DanglingReference {
                owner: format!("send from '{}'", send.source_track_id),
                missing: send.destination_bus_id.clone(),
            });
        }
        if send.destination_bus_id == master_id {
            return Err(TopologyError::SendTargetsMaster {
                source_id: send.source_track_id.clone(),
                destination: send.destination_bus_id.clone(),
            });
        }
        if !(0.0..=1.0).contains(&send.amount) || send.amount.is_nan() {
            return Err(TopologyError::InvalidSendAmount {
                source_id: send.source_track_id.clone(),
                destination: send.destination_bus_id.clone(),
                amount: send.amount,
            });
        }
    }

    processing_order(topology).map(|_| ())
}

/// Resolved edges of a topology, indexed by destination node
pub(crate) struct ResolvedEdges {
    /// Direct (fader-level) inputs, deduplicated, first-seen order
    pub direct: Vec<Vec<usize>>,
    /// Sends into each node as (source node, index into `Topology::sends`)
    pub sends: Vec<Vec<(usize, usize)>>,
}

impl ResolvedEdges {
    /// Union of direct inputs and send sources per node
    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        self.direct
            .iter()
            .zip(&self.sends)
            .map(|(direct, sends)| {
                let mut preds = direct.clone();
                for &(source, _) in sends {
                    if !preds.contains(&source) {
                        preds.push(source);
                    }
                }
                preds
            })
            .collect()
    }
}

/// Merge declared `inputIds`, the reverse of declared `outputIds`, sends, and
/// the implicit route from otherwise unconnected tracks into the MASTER bus
/// node. Unknown ids are skipped; [`validate`] reports them.
pub(crate) fn resolve_edges(topology: &Topology) -> ResolvedEdges {
    let index: HashMap<&str, usize> = topology
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let n = topology.nodes.len();
    let mut direct: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut sends: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    let mut has_output = vec![false; n];

    let add_edge = |from: usize, to: usize, direct: &mut Vec<Vec<usize>>| {
        if !direct[to].contains(&from) {
            direct[to].push(from);
        }
    };

    for (to, node) in topology.nodes.iter().enumerate() {
        for id in &node.input_ids {
            if let Some(&from) = index.get(id.as_str()) {
                add_edge(from, to, &mut direct);
                has_output[from] = true;
            }
        }
    }
    for (from, node) in topology.nodes.iter().enumerate() {
        for id in &node.output_ids {
            if let Some(&to) = index.get(id.as_str()) {
                add_edge(from, to, &mut direct);
                has_output[from] = true;
            }
        }
    }
    for (send_idx, send) in topology.sends.iter().enumerate() {
        if let (Some(&from), Some(&to)) = (
            index.get(send.source_track_id.as_str()),
            index.get(send.destination_bus_id.as_str()),
        ) {
            sends[to].push((from, send_idx));
            has_output[from] = true;
        }
    }

    if let Some(&master) = topology
        .master_bus()
        .and_then(|bus| index.get(bus.id.as_str()))
    {
        for (i, node) in topology.nodes.iter().enumerate() {
            if node.node_type == NodeType::Track && !has_output[i] {
                add_edge(i, master, &mut direct);
            }
        }
    }

    ResolvedEdges { direct, sends }
}

/// Predecessor lists (direct inputs and send sources) per node
pub(crate) fn resolve_inputs(topology: &Topology) -> Vec<Vec<usize>> {
    resolve_edges(topology).predecessors()
}

/// Deterministic topological order of node indices
///
/// Kahn's algorithm with a min-heap keyed by insertion index: whenever
/// several nodes are ready, the one declared first runs first. Identical
/// topologies always yield identical orders.
pub fn processing_order(topology: &Topology) -> Result<Vec<usize>, TopologyError> {
    let inputs = resolve_inputs(topology);
    order_from_inputs(topology, &inputs)
}

pub(crate) fn order_from_inputs(
    topology: &Topology,
    inputs: &[Vec<usize>],
) -> Result<Vec<usize>, TopologyError> {
    let n = inputs.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for (to, preds) in inputs.iter().enumerate() {
        in_degree[to] = preds.len();
        for &from in preds {
            successors[from].push(to);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &successors[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    // Every unprocessed node still has an unprocessed predecessor, so walking
    // predecessors from any of them must revisit a node.
    let Some(start) = (0..n).find(|&i| in_degree[i] > 0) else {
        return Ok(order);
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&pred) = inputs[current].iter().find(|&&p| in_degree[p] > 0) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == pred) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return Err(TopologyError::Cycle {
                nodes: cycle.iter().map(|&i| topology.nodes[i].id.clone()).collect(),
            });
        }
        path.push(pred);
        current = pred;
    }
    Err(TopologyError::Cycle {
        nodes: path.iter().map(|&i| topology.nodes[i].id.clone()).collect(),
    })
}
