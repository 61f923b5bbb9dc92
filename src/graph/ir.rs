// Offload partitioner intermediate representation
//
// Graph representation of nested computation graphs using petgraph.
// Provides an ergonomic builder API for constructing graphs and the
// data-flow queries the partitioning passes rely on.

use anyhow::{anyhow, Result};
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Node identifier in a graph (petgraph NodeIndex)
pub type NodeId = NodeIndex;

/// Index of a graph within a [`GraphArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphRef(pub(crate) usize);

/// Element type of a tensor value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Type not yet inferred or not carried by the source
    Undefined,
    Float32,
    Float16,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Int64,
    Bool,
}

/// A named, typed tensor descriptor
///
/// Produced by exactly one node output within its graph, or supplied
/// externally as a graph input or initializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDesc {
    pub name: String,
    pub dtype: ElementType,
    pub shape: Vec<i64>,
}

impl ValueDesc {
    pub fn new(name: impl Into<String>, dtype: ElementType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    /// Descriptor for a value whose type is not known yet
    pub fn undefined(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: ElementType::Undefined,
            shape: Vec::new(),
        }
    }
}

/// Storage for a constant tensor's payload
///
/// External storage carries a file location relative to a model directory,
/// with an optional byte window into that file.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantData {
    Inline(Vec<u8>),
    External {
        location: String,
        offset: u64,
        length: Option<u64>,
    },
}

/// A constant (initializer) bound to a graph
#[derive(Debug, Clone)]
pub struct ConstantTensor {
    desc: ValueDesc,
    data: ConstantData,
}

impl ConstantTensor {
    pub fn inline(desc: ValueDesc, bytes: Vec<u8>) -> Self {
        Self {
            desc,
            data: ConstantData::Inline(bytes),
        }
    }

    pub fn external(desc: ValueDesc, location: impl Into<String>, offset: u64, length: Option<u64>) -> Self {
        Self {
            desc,
            data: ConstantData::External {
                location: location.into(),
                offset,
                length,
            },
        }
    }

    pub fn desc(&self) -> &ValueDesc {
        &self.desc
    }

    pub fn data(&self) -> &ConstantData {
        &self.data
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.data, ConstantData::Inline(_))
    }

    /// Replace whatever storage this constant had with an inline payload
    pub fn set_inline(&mut self, bytes: Vec<u8>) {
        self.data = ConstantData::Inline(bytes);
    }
}

/// Node attribute value
#[derive(Debug, Clone)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    /// A nested computation graph owned by this node. Attach through
    /// [`GraphArena::attach_subgraph`] so the parent back-link is kept
    /// consistent with the attribute.
    Subgraph(GraphRef),
}

/// A node in the computation graph
#[derive(Debug, Clone)]
pub struct OpNode {
    /// Node name, unique within its graph when non-empty
    pub name: String,
    /// Operation type tag (e.g. "Gemm", "DequantizeLinear", "If")
    pub op_type: String,
    /// Named attributes, in declaration order
    pub attributes: Vec<(String, Attribute)>,
    /// Input value names, in positional order
    pub input_names: Vec<String>,
    /// Output value names, in positional order
    pub output_names: Vec<String>,
    /// Outer-scope values this node consumes on behalf of its nested
    /// subgraphs. Only control-flow nodes carry these.
    pub implicit_inputs: Vec<ValueDesc>,
}

impl OpNode {
    /// Get attribute by name
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(attr_name, _)| attr_name == name)
            .map(|(_, attr)| attr)
    }

    /// Nested subgraphs owned by this node, in attribute order
    pub fn subgraph_attributes(&self) -> impl Iterator<Item = (&str, GraphRef)> {
        self.attributes.iter().filter_map(|(name, attr)| match attr {
            Attribute::Subgraph(graph) => Some((name.as_str(), *graph)),
            _ => None,
        })
    }
}

/// Data-flow edge between nodes
#[derive(Debug, Clone)]
pub struct DataFlow {
    /// Which output slot on the source node
    pub output_slot: u8,
    /// Which input slot on the destination node
    pub input_slot: u8,
}

/// Non-owning back-link from a nested graph to the node that owns it
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub graph: GraphRef,
    pub node: NodeId,
    pub attribute: String,
}

/// A computation graph, either top-level or nested under a control-flow node
pub struct ComputationGraph {
    /// Graph name as declared by the source model
    name: String,

    /// The underlying petgraph structure. Removed slots are tombstoned;
    /// iteration skips them.
    graph: StableGraph<OpNode, DataFlow>,

    /// Value name to producer mapping: name → (node_id, output_slot)
    tensor_producers: FxHashMap<String, (NodeId, u8)>,

    /// Node name to node ID mapping
    name_to_id: FxHashMap<String, NodeId>,

    /// Declared graph inputs
    inputs: Vec<ValueDesc>,

    /// Declared graph outputs
    outputs: Vec<ValueDesc>,

    /// Constant initializers keyed by value name
    initializers: FxHashMap<String, ConstantTensor>,

    /// Best-known descriptor for every value name mentioned in this graph
    value_index: FxHashMap<String, ValueDesc>,

    /// Value names this graph reads from enclosing scopes
    outer_scope_values: FxHashSet<String>,

    /// Back-link to the owning node, absent for the root graph
    parent: Option<ParentLink>,
}

impl ComputationGraph {
    fn new(name: String) -> Self {
        Self {
            name,
            graph: StableGraph::new(),
            tensor_producers: FxHashMap::default(),
            name_to_id: FxHashMap::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            initializers: FxHashMap::default(),
            value_index: FxHashMap::default(),
            outer_scope_values: FxHashSet::default(),
            parent: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    /// Start building a new operation
    pub fn add_op(&mut self, op_type: impl Into<String>) -> NewOp<'_> {
        NewOp::new(self, op_type.into())
    }

    /// Get node by ID, None for tombstoned slots
    pub fn node(&self, node_id: NodeId) -> Option<&OpNode> {
        self.graph.node_weight(node_id)
    }

    /// Get mutable node by ID
    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut OpNode> {
        self.graph.node_weight_mut(node_id)
    }

    /// Get node ID by node name
    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Live node IDs in ascending index order, skipping tombstones
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Declare a graph input
    pub fn add_input(&mut self, desc: ValueDesc) {
        self.register_value(desc.clone());
        self.inputs.push(desc);
    }

    /// Declare a graph output
    pub fn add_output(&mut self, desc: ValueDesc) {
        self.register_value(desc.clone());
        self.outputs.push(desc);
    }

    /// Bind a constant initializer
    pub fn add_initializer(&mut self, tensor: ConstantTensor) {
        self.register_value(tensor.desc.clone());
        self.initializers.insert(tensor.desc.name.clone(), tensor);
    }

    /// Declared inputs, initializer-backed inputs included
    pub fn inputs_including_initializers(&self) -> &[ValueDesc] {
        &self.inputs
    }

    /// Replace the declared-input list wholesale
    pub fn set_inputs(&mut self, inputs: Vec<ValueDesc>) {
        for desc in &inputs {
            self.register_value(desc.clone());
        }
        self.inputs = inputs;
    }

    pub fn outputs(&self) -> &[ValueDesc] {
        &self.outputs
    }

    pub fn initializer(&self, name: &str) -> Option<&ConstantTensor> {
        self.initializers.get(name)
    }

    pub fn initializer_mut(&mut self, name: &str) -> Option<&mut ConstantTensor> {
        self.initializers.get_mut(name)
    }

    /// Whether a value is backed by a constant initializer of this graph
    pub fn is_constant_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    /// Whether a value name appears anywhere in this graph
    pub fn has_value(&self, name: &str) -> bool {
        self.value_index.contains_key(name)
    }

    /// Best-known descriptor for a value name
    pub fn value_desc(&self, name: &str) -> ValueDesc {
        self.value_index
            .get(name)
            .cloned()
            .unwrap_or_else(|| ValueDesc::undefined(name))
    }

    /// Register a value descriptor, upgrading an undefined placeholder
    pub fn register_value(&mut self, desc: ValueDesc) {
        match self.value_index.get(&desc.name) {
            Some(existing) if existing.dtype != ElementType::Undefined => {}
            _ => {
                self.value_index.insert(desc.name.clone(), desc);
            }
        }
    }

    /// Mark a value as supplied by an enclosing scope
    pub fn add_outer_scope_value(&mut self, name: &str) {
        self.outer_scope_values.insert(name.to_string());
    }

    pub fn is_outer_scope_ref(&self, name: &str) -> bool {
        self.outer_scope_values.contains(name)
    }

    /// Whether a node produces one of the declared graph outputs
    pub fn is_graph_output(&self, node_id: NodeId) -> bool {
        if let Some(node) = self.node(node_id) {
            for output_name in &node.output_names {
                if self.is_graph_output_name(output_name) {
                    return true;
                }
            }
        }
        false
    }

    pub fn is_graph_output_name(&self, name: &str) -> bool {
        self.outputs.iter().any(|out| out.name == name)
    }

    /// Producer of a value, if any node in this graph produces it
    pub fn producer(&self, name: &str) -> Option<(NodeId, u8)> {
        self.tensor_producers.get(name).copied()
    }

    /// Number of edges consuming this node's outputs
    pub fn consuming_edge_count(&self, node_id: NodeId) -> usize {
        self.graph.edges_directed(node_id, Direction::Outgoing).count()
    }

    /// The single consumer of this node's outputs, when there is exactly one
    pub fn sole_consumer(&self, node_id: NodeId) -> Option<NodeId> {
        let mut consumers = self.graph.edges_directed(node_id, Direction::Outgoing);
        let first = consumers.next()?.target();
        if consumers.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Nested subgraphs owned by this graph's nodes, in node order
    pub fn nested_subgraphs(&self) -> Vec<GraphRef> {
        let mut nested = Vec::new();
        for node_id in self.graph.node_indices() {
            if let Some(node) = self.node(node_id) {
                for (_, subgraph) in node.subgraph_attributes() {
                    nested.push(subgraph);
                }
            }
        }
        nested
    }

    /// Remove a node from the graph, leaving a tombstoned slot
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<()> {
        if self.is_graph_output(node_id) {
            return Err(anyhow!("cannot remove graph output node"));
        }

        let output_names = self.node(node_id).map(|n| n.output_names.clone());
        let node_name = self
            .node(node_id)
            .and_then(|n| (!n.name.is_empty()).then(|| n.name.clone()));

        if let Some(outputs) = output_names {
            for output_name in &outputs {
                self.tensor_producers.remove(output_name);
            }
        }
        if let Some(name) = node_name {
            self.name_to_id.remove(&name);
        }

        self.graph.remove_node(node_id);
        Ok(())
    }

    /// Topological order with ties broken toward the lowest node index
    ///
    /// Kahn's algorithm draining ready nodes from a min-heap. All node
    /// subsets and capability positions are expressed against this order.
    pub fn priority_topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut ready: BinaryHeap<Reverse<NodeId>> = BinaryHeap::new();

        for node_id in self.graph.node_indices() {
            let degree = self.graph.edges_directed(node_id, Direction::Incoming).count();
            indegree.insert(node_id, degree);
            if degree == 0 {
                ready.push(Reverse(node_id));
            }
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node_id)) = ready.pop() {
            order.push(node_id);
            for edge in self.graph.edges_directed(node_id, Direction::Outgoing) {
                let target = edge.target();
                if let Some(degree) = indegree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(target));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(anyhow!("graph '{}' contains cycles", self.name));
        }
        Ok(order)
    }
}

/// Builder for adding operations to a graph
pub struct NewOp<'a> {
    graph: &'a mut ComputationGraph,
    node: OpNode,
}

impl<'a> NewOp<'a> {
    fn new(graph: &'a mut ComputationGraph, op_type: String) -> Self {
        Self {
            graph,
            node: OpNode {
                name: String::new(),
                op_type,
                attributes: Vec::new(),
                input_names: Vec::new(),
                output_names: Vec::new(),
                implicit_inputs: Vec::new(),
            },
        }
    }

    /// Set node name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.node.name = name.into();
        self
    }

    /// Append an input value name
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.node.input_names.push(name.into());
        self
    }

    /// Append an output value name
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.node.output_names.push(name.into());
        self
    }

    /// Append an outer-scope value this node carries for its subgraphs
    pub fn implicit_input(mut self, desc: ValueDesc) -> Self {
        self.node.implicit_inputs.push(desc);
        self
    }

    /// Add an attribute
    pub fn attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.node.attributes.push((name.into(), attr));
        self
    }

    /// Finish building, wire data-flow edges from known producers, and
    /// return the new node's ID
    ///
    /// Edges are wired by input name against producers already present,
    /// so nodes should be added producers-first. Initializer-backed and
    /// empty (optional) inputs carry no edge.
    pub fn finish(self) -> NodeId {
        let node = self.node;
        let node_id = self.graph.graph.add_node(node.clone());

        // Register outputs as produced here
        for (slot, output_name) in node.output_names.iter().enumerate() {
            self.graph
                .tensor_producers
                .insert(output_name.clone(), (node_id, slot as u8));
            self.graph.register_value(ValueDesc::undefined(output_name));
        }

        // Wire edges from known producers
        for (input_slot, input_name) in node.input_names.iter().enumerate() {
            self.graph.register_value(ValueDesc::undefined(input_name));
            if input_name.is_empty() || self.graph.initializers.contains_key(input_name) {
                continue;
            }
            if let Some(&(source_id, output_slot)) = self.graph.tensor_producers.get(input_name) {
                self.graph.graph.add_edge(
                    source_id,
                    node_id,
                    DataFlow {
                        output_slot,
                        input_slot: input_slot as u8,
                    },
                );
            }
        }

        for implicit in &node.implicit_inputs {
            self.graph.register_value(implicit.clone());
        }

        if !node.name.is_empty() {
            self.graph.name_to_id.insert(node.name.clone(), node_id);
        }

        node_id
    }
}

/// Arena owning a tree of nested computation graphs
///
/// Graphs are addressed by [`GraphRef`]; parent links are non-owning
/// back-references used only for ancestor walks.
pub struct GraphArena {
    graphs: Vec<ComputationGraph>,
}

impl GraphArena {
    pub fn new() -> Self {
        Self { graphs: Vec::new() }
    }

    /// Add a graph with no parent. It becomes a nested subgraph once
    /// attached through [`GraphArena::attach_subgraph`].
    pub fn add_graph(&mut self, name: impl Into<String>) -> GraphRef {
        let graph_ref = GraphRef(self.graphs.len());
        self.graphs.push(ComputationGraph::new(name.into()));
        graph_ref
    }

    pub fn graph(&self, graph_ref: GraphRef) -> &ComputationGraph {
        &self.graphs[graph_ref.0]
    }

    pub fn graph_mut(&mut self, graph_ref: GraphRef) -> &mut ComputationGraph {
        &mut self.graphs[graph_ref.0]
    }

    /// All graphs in the arena, in creation order
    pub fn graph_refs(&self) -> Vec<GraphRef> {
        (0..self.graphs.len()).map(GraphRef).collect()
    }

    /// Own `child` as a subgraph attribute of `node` in `parent`
    ///
    /// Keeps the attribute and the child's back-link consistent. The
    /// nesting relation must stay a tree, so a child can be attached at
    /// most once.
    pub fn attach_subgraph(
        &mut self,
        parent: GraphRef,
        node: NodeId,
        attribute: impl Into<String>,
        child: GraphRef,
    ) -> Result<()> {
        let attribute = attribute.into();
        if self.graphs[child.0].parent.is_some() {
            return Err(anyhow!(
                "graph '{}' already has a parent",
                self.graphs[child.0].name
            ));
        }
        {
            let parent_graph = &mut self.graphs[parent.0];
            let node_data = parent_graph
                .node_mut(node)
                .ok_or_else(|| anyhow!("no node at index {:?}", node))?;
            node_data
                .attributes
                .push((attribute.clone(), Attribute::Subgraph(child)));
        }
        self.graphs[child.0].parent = Some(ParentLink {
            graph: parent,
            node,
            attribute,
        });
        Ok(())
    }

    /// Walk parent links up to the root ancestor
    pub fn top_level(&self, mut graph_ref: GraphRef) -> GraphRef {
        while let Some(link) = self.graph(graph_ref).parent() {
            graph_ref = link.graph;
        }
        graph_ref
    }
}

impl Default for GraphArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> (GraphArena, GraphRef, NodeId, NodeId) {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("main");
        let graph = arena.graph_mut(g);
        let producer = graph
            .add_op("Constant")
            .name("const1")
            .output("c1")
            .finish();
        let consumer = graph
            .add_op("Relu")
            .name("relu1")
            .input("c1")
            .output("r1")
            .finish();
        (arena, g, producer, consumer)
    }

    #[test]
    fn builder_wires_edges_from_producers() {
        let (arena, g, producer, consumer) = two_node_graph();
        let graph = arena.graph(g);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.consuming_edge_count(producer), 1);
        assert_eq!(graph.sole_consumer(producer), Some(consumer));
        assert_eq!(graph.producer("c1"), Some((producer, 0)));
    }

    #[test]
    fn initializer_inputs_carry_no_edge() {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("main");
        let graph = arena.graph_mut(g);
        graph.add_initializer(ConstantTensor::inline(
            ValueDesc::new("w", ElementType::Int16, vec![4]),
            vec![0; 8],
        ));
        let source = graph.add_op("Identity").name("id").output("w2").finish();
        let gemm = graph
            .add_op("Gemm")
            .name("gemm")
            .input("w")
            .input("w2")
            .output("y")
            .finish();
        assert_eq!(graph.consuming_edge_count(source), 1);
        // Only the "w2" edge exists; the initializer input does not connect
        let order = graph.priority_topological_order().unwrap();
        assert_eq!(order, vec![source, gemm]);
    }

    #[test]
    fn priority_order_breaks_ties_by_index() {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("main");
        let graph = arena.graph_mut(g);
        // Three independent roots plus one join; roots must drain in index order
        let a = graph.add_op("A").name("a").output("va").finish();
        let b = graph.add_op("B").name("b").output("vb").finish();
        let c = graph.add_op("C").name("c").output("vc").finish();
        let join = graph
            .add_op("Concat")
            .name("join")
            .input("va")
            .input("vb")
            .input("vc")
            .output("out")
            .finish();
        let order = graph.priority_topological_order().unwrap();
        assert_eq!(order, vec![a, b, c, join]);
    }

    #[test]
    fn removed_nodes_are_skipped_by_iteration() {
        let (mut arena, g, producer, consumer) = two_node_graph();
        let graph = arena.graph_mut(g);
        graph.remove_node(consumer).unwrap();
        assert_eq!(graph.node_ids(), vec![producer]);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.node(consumer).is_none());
        // Producer map no longer resolves the removed node's output
        assert_eq!(graph.producer("r1"), None);
    }

    #[test]
    fn cannot_remove_output_producer() {
        let (mut arena, g, _, consumer) = two_node_graph();
        let graph = arena.graph_mut(g);
        graph.add_output(ValueDesc::undefined("r1"));
        assert!(graph.remove_node(consumer).is_err());
    }

    #[test]
    fn attach_subgraph_sets_parent_link() {
        let mut arena = GraphArena::new();
        let root = arena.add_graph("root");
        let cond = arena
            .graph_mut(root)
            .add_op("If")
            .name("cond")
            .output("out")
            .finish();
        let then_branch = arena.add_graph("then");
        arena
            .attach_subgraph(root, cond, "then_branch", then_branch)
            .unwrap();

        let link = arena.graph(then_branch).parent().unwrap();
        assert_eq!(link.graph, root);
        assert_eq!(link.node, cond);
        assert_eq!(link.attribute, "then_branch");
        assert_eq!(arena.top_level(then_branch), root);
        assert_eq!(arena.graph(root).nested_subgraphs(), vec![then_branch]);

        // Tree invariant: a second owner is rejected
        let other = arena.add_graph("other");
        let node = arena
            .graph_mut(other)
            .add_op("Loop")
            .name("loop")
            .output("o")
            .finish();
        assert!(arena.attach_subgraph(other, node, "body", then_branch).is_err());
    }

    #[test]
    fn outer_scope_values_are_tracked() {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("sub");
        let graph = arena.graph_mut(g);
        graph.add_op("Add").name("add").input("x").input("y").output("z").finish();
        assert!(graph.has_value("x"));
        assert!(!graph.is_outer_scope_ref("x"));
        graph.add_outer_scope_value("x");
        assert!(graph.is_outer_scope_ref("x"));
    }
}
