// Auxiliary node selection
//
// Some nodes are not worth offloading on their own but must travel with
// their consumer when it is offloaded: the canonical case is a
// dequantization step feeding a weight into a matmul-like op. The
// selector flags every node matching the pattern and records which
// consumer each one belongs to, so later reconciliation can keep the
// pair together even when the backend's parser drops the auxiliary.

use crate::error::Result;
use crate::graph::{ComputationGraph, ElementType, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Structural pattern an auxiliary node must match
///
/// The fixed op tag and type set of the original selection rule are the
/// default; both are configurable since the qualifying set is expected
/// to grow.
#[derive(Debug, Clone)]
pub struct AuxiliaryPattern {
    op_type: String,
    qualifying_types: Vec<ElementType>,
}

impl AuxiliaryPattern {
    pub fn new(op_type: impl Into<String>, qualifying_types: Vec<ElementType>) -> Self {
        Self {
            op_type: op_type.into(),
            qualifying_types,
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }
}

impl Default for AuxiliaryPattern {
    fn default() -> Self {
        Self {
            op_type: "DequantizeLinear".to_string(),
            qualifying_types: vec![ElementType::Int32, ElementType::Int16, ElementType::Uint16],
        }
    }
}

/// Result of one selection pass
#[derive(Debug, Default)]
pub struct AuxiliarySelection {
    /// Indices of every qualifying auxiliary node
    pub selected: FxHashSet<NodeId>,
    /// Consumer node index → its auxiliary node index
    pub consumer_to_auxiliary: FxHashMap<NodeId, NodeId>,
}

/// Scans the graph for auxiliary-pattern nodes
pub struct AuxiliaryNodeSelector;

impl AuxiliaryNodeSelector {
    /// Flag qualifying nodes in priority topological order
    ///
    /// A node qualifies when all of the following hold: its op tag
    /// matches the pattern, exactly one edge consumes its output, the
    /// output is not a graph output, and its first input is a constant
    /// initializer of a qualifying element type.
    pub fn select(graph: &ComputationGraph, pattern: &AuxiliaryPattern) -> Result<AuxiliarySelection> {
        let mut selection = AuxiliarySelection::default();
        let order = graph.priority_topological_order()?;
        for node_id in order {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            if node.op_type != pattern.op_type {
                continue;
            }
            if graph.consuming_edge_count(node_id) != 1 {
                continue;
            }
            if graph.is_graph_output(node_id) {
                continue;
            }
            let Some(input_name) = node.input_names.first() else {
                continue;
            };
            let Some(constant) = graph.initializer(input_name) else {
                continue;
            };
            if !pattern.qualifying_types.contains(&constant.desc().dtype) {
                continue;
            }
            let Some(consumer) = graph.sole_consumer(node_id) else {
                continue;
            };
            selection.selected.insert(node_id);
            selection.consumer_to_auxiliary.insert(consumer, node_id);
            debug!(auxiliary = %node.name, consumer = ?consumer, "selected auxiliary node");
        }
        debug!(total = selection.selected.len(), "auxiliary selection complete");
        Ok(selection)
    }
}
