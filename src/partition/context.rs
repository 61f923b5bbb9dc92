// Per-graph scope contexts
//
// A newly assembled graph has not been through full validation yet, so
// none of the usual resolve-time scope queries are available. The store
// keeps, per graph identity, enough of that information to answer them:
// which values a graph produces, which it pulls in from outside, and
// which inputs were synthesized during scope resolution.

use crate::backend::InlineMaterializer;
use crate::error::{PartitionError, Result};
use crate::graph::{ComputationGraph, GraphArena, GraphRef, ValueDesc};
use crate::partition::identity::{identify, GraphId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Name-deduplicated value list that preserves insertion order
///
/// Downstream artifacts are rebuilt from these lists, so iteration order
/// must be stable across runs.
#[derive(Debug, Clone, Default)]
pub struct OrderedValueSet {
    entries: Vec<ValueDesc>,
    names: FxHashSet<String>,
}

impl OrderedValueSet {
    /// Insert a descriptor unless its name is already present.
    /// Returns whether the entry was added.
    pub fn insert(&mut self, desc: ValueDesc) -> bool {
        if self.names.insert(desc.name.clone()) {
            self.entries.push(desc);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueDesc> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<ValueDesc> {
        self.entries
    }
}

/// Scope information recorded for one graph identity
#[derive(Debug, Clone, Default)]
pub struct SubGraphContext {
    /// Every value name produced as a node output within the graph
    output_args: FxHashSet<String>,

    /// Values consumed but not locally produced, with their descriptors.
    /// These are the graph's effective inputs and initializers.
    inputs_and_initializers: OrderedValueSet,

    /// Outer-scope values promoted to synthetic top-level inputs during
    /// scope resolution, keyed by their final name
    manually_added_inputs: OrderedValueSet,
}

impl SubGraphContext {
    pub fn output_args(&self) -> &FxHashSet<String> {
        &self.output_args
    }

    pub fn inputs_and_initializers(&self) -> &OrderedValueSet {
        &self.inputs_and_initializers
    }

    pub fn manually_added_inputs(&self) -> &OrderedValueSet {
        &self.manually_added_inputs
    }

    pub fn is_manually_added(&self, name: &str) -> bool {
        self.manually_added_inputs.contains(name)
    }

    pub(crate) fn add_manual_input(&mut self, desc: ValueDesc) {
        self.manually_added_inputs.insert(desc);
    }
}

/// Registry mapping graph identity to its [`SubGraphContext`]
///
/// Scoped to a single partitioning attempt. Built bottom-up, innermost
/// subgraphs first, and consulted by every later pass. A partial build
/// after a failure leaves the store inconsistent; discard it wholesale
/// rather than resuming.
#[derive(Default)]
pub struct SubgraphContextStore {
    contexts: FxHashMap<GraphId, SubGraphContext>,
}

impl SubgraphContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, graph_id: &GraphId) -> bool {
        self.contexts.contains_key(graph_id)
    }

    pub fn context(&self, graph_id: &GraphId) -> Option<&SubGraphContext> {
        self.contexts.get(graph_id)
    }

    pub(crate) fn context_mut(&mut self, graph_id: &GraphId) -> Option<&mut SubGraphContext> {
        self.contexts.get_mut(graph_id)
    }

    /// Build contexts for a graph and all its nested subgraphs
    ///
    /// Recurses into subgraph attributes first, so inner contexts exist
    /// before outer ones. Building is idempotent per graph identity; a
    /// context that already exists is left untouched.
    ///
    /// Every externally-sourced input is handed to the materializer so
    /// out-of-line constants become directly embedded. That side effect
    /// has no rollback; a materialization failure aborts the build and
    /// the store must be discarded.
    pub fn build(
        &mut self,
        arena: &mut GraphArena,
        graph_ref: GraphRef,
        materializer: &mut dyn InlineMaterializer,
    ) -> Result<()> {
        let nested = arena.graph(graph_ref).nested_subgraphs();
        for subgraph in nested {
            self.build(arena, subgraph, materializer)?;
        }

        let graph_id = identify(arena.graph(graph_ref));
        if self.contexts.contains_key(&graph_id) {
            return Ok(());
        }

        let mut context = SubGraphContext::default();
        let mut externals: Vec<ValueDesc> = Vec::new();
        {
            let graph = arena.graph(graph_ref);
            for node_id in graph.node_ids() {
                if let Some(node) = graph.node(node_id) {
                    for output in &node.output_names {
                        context.output_args.insert(output.clone());
                    }
                }
            }

            for node_id in graph.node_ids() {
                if let Some(node) = graph.node(node_id) {
                    for input in &node.input_names {
                        if input.is_empty() || context.output_args.contains(input) {
                            continue;
                        }
                        // Not the output of another node, so it comes from a
                        // graph input or an initializer
                        let desc = graph.value_desc(input);
                        if context.inputs_and_initializers.insert(desc.clone()) {
                            externals.push(desc);
                        }
                    }
                }
            }
        }

        for desc in externals {
            materializer
                .materialize(arena.graph_mut(graph_ref), &desc.name)
                .map_err(|err| PartitionError::InlineMaterialization {
                    name: desc.name.clone(),
                    reason: err.to_string(),
                })?;
        }

        debug!(
            graph = %graph_id,
            outputs = context.output_args.len(),
            external_inputs = context.inputs_and_initializers.len(),
            "built subgraph context"
        );
        self.contexts.insert(graph_id, context);
        Ok(())
    }

    /// Whether a value resolves within one graph: produced by a node
    /// there, or recorded among its effective inputs and initializers
    pub fn is_local_value(&self, graph: &ComputationGraph, name: &str) -> bool {
        match self.contexts.get(&identify(graph)) {
            Some(context) => {
                context.output_args.contains(name)
                    || context.inputs_and_initializers.contains(name)
            }
            None => false,
        }
    }

    /// Whether a value resolves in a graph or, when `check_ancestors` is
    /// set, in any strictly enclosing graph
    pub fn is_input_initializer_or_output(
        &self,
        arena: &GraphArena,
        graph_ref: GraphRef,
        name: &str,
        check_ancestors: bool,
    ) -> bool {
        if self.is_local_value(arena.graph(graph_ref), name) {
            return true;
        }
        if !check_ancestors {
            return false;
        }
        match arena.graph(graph_ref).parent() {
            Some(link) => self.is_input_initializer_or_output(arena, link.graph, name, true),
            None => false,
        }
    }

    /// Whether a value a graph reads resolves somewhere in its enclosing
    /// scopes
    pub fn is_outer_scope_value(&self, arena: &GraphArena, graph_ref: GraphRef, name: &str) -> bool {
        match arena.graph(graph_ref).parent() {
            Some(link) => self.is_input_initializer_or_output(arena, link.graph, name, true),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackedInliner;
    use crate::graph::{ConstantTensor, ElementType, GraphArena};
    use anyhow::anyhow;

    struct CountingInliner {
        calls: Vec<String>,
        fail_on: Option<String>,
    }

    impl CountingInliner {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                fail_on: None,
            }
        }
    }

    impl InlineMaterializer for CountingInliner {
        fn materialize(&mut self, _graph: &mut ComputationGraph, name: &str) -> anyhow::Result<()> {
            if self.fail_on.as_deref() == Some(name) {
                return Err(anyhow!("no backing store for '{}'", name));
            }
            self.calls.push(name.to_string());
            Ok(())
        }
    }

    fn gemm_graph() -> (GraphArena, GraphRef) {
        let mut arena = GraphArena::new();
        let g = arena.add_graph("main");
        let graph = arena.graph_mut(g);
        graph.add_input(ValueDesc::new("x", ElementType::Float32, vec![1, 4]));
        graph.add_initializer(ConstantTensor::inline(
            ValueDesc::new("w", ElementType::Float32, vec![4, 4]),
            vec![0; 64],
        ));
        graph.add_op("Gemm").name("gemm").input("x").input("w").output("y").finish();
        graph.add_op("Relu").name("relu").input("y").output("z").finish();
        graph.add_output(ValueDesc::new("z", ElementType::Float32, vec![1, 4]));
        (arena, g)
    }

    #[test]
    fn records_outputs_and_external_inputs() {
        let (mut arena, g) = gemm_graph();
        let mut store = SubgraphContextStore::new();
        let mut inliner = CountingInliner::new();
        store.build(&mut arena, g, &mut inliner).unwrap();

        let context = store.context(&identify(arena.graph(g))).unwrap();
        assert!(context.output_args().contains("y"));
        assert!(context.output_args().contains("z"));
        assert!(context.inputs_and_initializers().contains("x"));
        assert!(context.inputs_and_initializers().contains("w"));
        // Node outputs are not recorded as inputs
        assert!(!context.inputs_and_initializers().contains("y"));
        // Every external input was offered for inline materialization
        assert_eq!(inliner.calls, vec!["x".to_string(), "w".to_string()]);
    }

    #[test]
    fn rebuild_is_a_no_op() {
        let (mut arena, g) = gemm_graph();
        let mut store = SubgraphContextStore::new();
        let mut inliner = CountingInliner::new();
        store.build(&mut arena, g, &mut inliner).unwrap();
        let calls_after_first = inliner.calls.len();
        store.build(&mut arena, g, &mut inliner).unwrap();
        assert_eq!(inliner.calls.len(), calls_after_first);
    }

    #[test]
    fn structurally_identical_graphs_share_a_context() {
        let (mut arena_a, g_a) = gemm_graph();
        let mut store = SubgraphContextStore::new();
        let mut inliner = CountingInliner::new();
        store.build(&mut arena_a, g_a, &mut inliner).unwrap();
        let calls_after_first = inliner.calls.len();

        // A second graph with the same name and node names resolves to the
        // same identity, so its build finds the existing context
        let (mut arena_b, g_b) = gemm_graph();
        assert_eq!(identify(arena_a.graph(g_a)), identify(arena_b.graph(g_b)));
        store.build(&mut arena_b, g_b, &mut inliner).unwrap();
        assert_eq!(inliner.calls.len(), calls_after_first);
    }

    #[test]
    fn materialization_failure_is_fatal() {
        let (mut arena, g) = gemm_graph();
        let mut store = SubgraphContextStore::new();
        let mut inliner = CountingInliner::new();
        inliner.fail_on = Some("w".to_string());
        let err = store.build(&mut arena, g, &mut inliner).unwrap_err();
        assert!(matches!(err, PartitionError::InlineMaterialization { ref name, .. } if name == "w"));
    }

    #[test]
    fn nested_subgraphs_build_innermost_first() {
        let mut arena = GraphArena::new();
        let root = arena.add_graph("root");
        let cond = arena
            .graph_mut(root)
            .add_op("If")
            .name("cond")
            .input("p")
            .output("out")
            .finish();
        let inner = arena.add_graph("then");
        arena.graph_mut(inner).add_op("Relu").name("inner_relu").input("a").output("b").finish();
        arena.attach_subgraph(root, cond, "then_branch", inner).unwrap();

        let mut store = SubgraphContextStore::new();
        let mut materializer = FileBackedInliner::new();
        store.build(&mut arena, root, &mut materializer).unwrap();

        assert!(store.contains(&identify(arena.graph(root))));
        assert!(store.contains(&identify(arena.graph(inner))));
        let inner_ctx = store.context(&identify(arena.graph(inner))).unwrap();
        assert!(inner_ctx.inputs_and_initializers().contains("a"));
    }

    #[test]
    fn scope_queries_walk_ancestors() {
        let mut arena = GraphArena::new();
        let root = arena.add_graph("root");
        arena.graph_mut(root).add_op("Constant").name("k").output("seed").finish();
        let cond = arena
            .graph_mut(root)
            .add_op("If")
            .name("cond")
            .output("out")
            .finish();
        let inner = arena.add_graph("then");
        arena.graph_mut(inner).add_op("Relu").name("r").input("seed").output("b").finish();
        arena.attach_subgraph(root, cond, "then_branch", inner).unwrap();

        let mut store = SubgraphContextStore::new();
        let mut materializer = FileBackedInliner::new();
        store.build(&mut arena, root, &mut materializer).unwrap();

        assert!(store.is_local_value(arena.graph(root), "seed"));
        // Consumed-but-not-produced values count as the subgraph's own
        // effective inputs
        assert!(store.is_local_value(arena.graph(inner), "seed"));
        // "seed" is produced in the root scope, so the subgraph sees it as
        // an outer-scope value
        assert!(store.is_outer_scope_value(&arena, inner, "seed"));
        assert!(!store.is_outer_scope_value(&arena, root, "seed"));
        assert!(!store.is_outer_scope_value(&arena, inner, "unknown"));
    }
}
