// Compute capabilities and selection reconciliation
//
// A capability is the unit handed to the backend: an ordered set of node
// indices within one flattened graph, plus the optimization behavior to
// run over those nodes before compilation. Backend parsers express their
// proposals as positions into the priority topological order; the
// augmenter works in that space, the reconciler in node-index space.

use crate::error::Result;
use crate::graph::{ComputationGraph, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Rewrite callback attached to a capability, invoked later over the
/// selected nodes
pub type OptimizationFn =
    Arc<dyn Fn(&mut ComputationGraph, &[NodeId]) -> anyhow::Result<()> + Send + Sync>;

/// A backend-submittable subset of one graph's nodes
///
/// Indices must all belong to the same graph and must have existed when
/// the capability was produced.
#[derive(Clone, Default)]
pub struct ComputeCapability {
    nodes: Vec<NodeId>,
    optimization: Option<OptimizationFn>,
}

impl ComputeCapability {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            optimization: None,
        }
    }

    pub fn with_optimization(mut self, optimization: OptimizationFn) -> Self {
        self.optimization = Some(optimization);
        self
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn optimization(&self) -> Option<&OptimizationFn> {
        self.optimization.as_ref()
    }

    /// Share another capability's optimization behavior
    pub fn copy_optimization_from(&mut self, other: &ComputeCapability) {
        self.optimization = other.optimization.clone();
    }
}

impl fmt::Debug for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeCapability")
            .field("nodes", &self.nodes)
            .field("has_optimization", &self.optimization.is_some())
            .finish()
    }
}

/// One backend-parser proposal: positions into the graph's priority
/// topological order, plus whether the backend accepted the subset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSubset {
    pub topo_positions: Vec<usize>,
    pub accepted: bool,
}

impl CandidateSubset {
    pub fn accepted(topo_positions: Vec<usize>) -> Self {
        Self {
            topo_positions,
            accepted: true,
        }
    }

    pub fn rejected(topo_positions: Vec<usize>) -> Self {
        Self {
            topo_positions,
            accepted: false,
        }
    }

    /// Resolve the positions into node indices
    pub fn to_capability(&self, graph: &ComputationGraph) -> Result<ComputeCapability> {
        let order = graph.priority_topological_order()?;
        let mut nodes = Vec::with_capacity(self.topo_positions.len());
        for &position in &self.topo_positions {
            if let Some(&node_id) = order.get(position) {
                nodes.push(node_id);
            }
        }
        Ok(ComputeCapability::new(nodes))
    }
}

/// Intersect two independently produced selections into one capability
///
/// Keeps only the backend-accepted indices that are also in the original
/// selection and in the auxiliary selected set, preserving the backend
/// selection's order, and carries the original selection's optimization
/// behavior unchanged.
pub fn reconcile(
    selection: &ComputeCapability,
    auxiliary_selected: &FxHashSet<NodeId>,
    backend: &ComputeCapability,
) -> ComputeCapability {
    let selection_set: FxHashSet<NodeId> = selection.nodes().iter().copied().collect();

    let mut nodes = Vec::new();
    for &index in backend.nodes() {
        if !selection_set.contains(&index) {
            continue;
        }
        if !auxiliary_selected.contains(&index) {
            continue;
        }
        nodes.push(index);
    }

    let mut capability = ComputeCapability::new(nodes);
    capability.copy_optimization_from(selection);
    capability
}

/// Re-admit auxiliary nodes the backend's parser filtered out
///
/// For every accepted node with a mapped auxiliary, the auxiliary is
/// appended to the subset unless some subset in the collection, accepted
/// or not, already covers it. Purely additive: nothing is ever removed,
/// and the caller remains responsible for the augmented subset staying
/// compilable.
pub fn augment(
    graph: &ComputationGraph,
    subset: &mut CandidateSubset,
    collection: &[CandidateSubset],
    consumer_to_auxiliary: &FxHashMap<NodeId, NodeId>,
) -> Result<()> {
    if consumer_to_auxiliary.is_empty() || !subset.accepted {
        return Ok(());
    }

    let order = graph.priority_topological_order()?;
    let holds = |candidate: &CandidateSubset, auxiliary: NodeId| {
        candidate
            .topo_positions
            .iter()
            .any(|&position| order.get(position) == Some(&auxiliary))
    };

    let accepted = subset.topo_positions.clone();
    for position in accepted {
        let Some(&consumer) = order.get(position) else {
            continue;
        };
        let Some(&auxiliary) = consumer_to_auxiliary.get(&consumer) else {
            continue;
        };
        let covered = collection
            .iter()
            .any(|candidate| holds(candidate, auxiliary))
            || holds(subset, auxiliary);
        if covered {
            continue;
        }
        if let Some(auxiliary_position) = order.iter().position(|&node| node == auxiliary) {
            subset.topo_positions.push(auxiliary_position);
            if let Some(node) = graph.node(auxiliary) {
                tracing::debug!(
                    auxiliary = %node.name,
                    "re-admitted auxiliary node filtered out by the backend parser"
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ConstantTensor, ElementType, GraphArena, GraphRef, ValueDesc};
    use crate::partition::auxiliary::{AuxiliaryNodeSelector, AuxiliaryPattern};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// dq_w feeds gemm; relu follows. Topological order: dq_w, gemm, relu.
    fn quantized_chain() -> (GraphArena, GraphRef) {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("main");
        let graph = arena.graph_mut(g);
        graph.add_input(ValueDesc::new("x", ElementType::Float32, vec![1, 4]));
        graph.add_initializer(ConstantTensor::inline(
            ValueDesc::new("w_q", ElementType::Int16, vec![4, 4]),
            vec![0; 32],
        ));
        graph
            .add_op("DequantizeLinear")
            .name("dq_w")
            .input("w_q")
            .output("w")
            .finish();
        graph
            .add_op("Gemm")
            .name("gemm")
            .input("x")
            .input("w")
            .output("y")
            .finish();
        graph.add_op("Relu").name("relu").input("y").output("z").finish();
        graph.add_output(ValueDesc::new("z", ElementType::Float32, vec![1, 4]));
        (arena, g)
    }

    #[test]
    fn reconcile_keeps_the_three_way_intersection() {
        let (mut arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let dq = graph.node_id_by_name("dq_w").unwrap();
        let gemm = graph.node_id_by_name("gemm").unwrap();
        let relu = graph.node_id_by_name("relu").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let selection = ComputeCapability::new(vec![dq, gemm]).with_optimization(Arc::new(
            move |_graph, _nodes| {
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));
        let auxiliary: FxHashSet<NodeId> = [dq].into_iter().collect();
        let backend = ComputeCapability::new(vec![dq, gemm, relu]);

        let reconciled = reconcile(&selection, &auxiliary, &backend);
        assert_eq!(reconciled.nodes(), &[dq]);

        // The optimization behavior travels with the reconciled capability
        let optimization = reconciled.optimization().unwrap();
        (optimization.as_ref())(arena.graph_mut(g), reconciled.nodes()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn augment_re_admits_filtered_auxiliary() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        // Backend accepted gemm and relu (positions 1 and 2) but dropped dq
        let mut subset = CandidateSubset::accepted(vec![1, 2]);
        let collection = vec![subset.clone()];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();

        assert_eq!(subset.topo_positions, vec![1, 2, 0]);
        let capability = subset.to_capability(graph).unwrap();
        let dq = graph.node_id_by_name("dq_w").unwrap();
        assert!(capability.nodes().contains(&dq));
    }

    #[test]
    fn augment_never_removes_and_never_shrinks() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        let mut subset = CandidateSubset::accepted(vec![1]);
        let before = subset.topo_positions.clone();
        let collection = vec![subset.clone()];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();

        assert!(subset.topo_positions.len() >= before.len());
        for position in before {
            assert!(subset.topo_positions.contains(&position));
        }
    }

    #[test]
    fn auxiliary_covered_by_sibling_subset_is_not_duplicated() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        // A sibling subset already carries the auxiliary at position 0
        let mut subset = CandidateSubset::accepted(vec![1, 2]);
        let sibling = CandidateSubset::accepted(vec![0]);
        let collection = vec![subset.clone(), sibling];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();

        assert_eq!(subset.topo_positions, vec![1, 2]);
    }

    #[test]
    fn coverage_check_also_counts_rejected_siblings() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        let mut subset = CandidateSubset::accepted(vec![1, 2]);
        let sibling = CandidateSubset::rejected(vec![0]);
        let collection = vec![subset.clone(), sibling];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();

        assert_eq!(subset.topo_positions, vec![1, 2]);
    }

    #[test]
    fn rejected_subsets_are_left_alone() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        let mut subset = CandidateSubset::rejected(vec![1, 2]);
        let collection = vec![subset.clone()];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();
        assert_eq!(subset.topo_positions, vec![1, 2]);
    }

    #[test]
    fn auxiliary_already_in_own_subset_is_not_duplicated() {
        let (arena, g) = quantized_chain();
        let graph = arena.graph(g);
        let selection =
            AuxiliaryNodeSelector::select(graph, &AuxiliaryPattern::default()).unwrap();

        let mut subset = CandidateSubset::accepted(vec![0, 1, 2]);
        let collection = vec![subset.clone()];
        augment(graph, &mut subset, &collection, &selection.consumer_to_auxiliary).unwrap();
        assert_eq!(subset.topo_positions, vec![0, 1, 2]);
    }
}
