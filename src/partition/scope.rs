// Outer-scope value resolution across nested subgraphs
//
// A graph assembled for backend submission mirrors the structure of the
// original graph it was carved from, but the assembly can lose closure
// captures: values a nested subgraph reads from an enclosing scope. The
// resolver walks both graphs in parallel, innermost subgraphs first, and
// promotes every capture that no enclosing scope of the assembled graph
// can satisfy to an explicit input on its top-level ancestor.

use crate::error::{PartitionError, Result};
use crate::graph::{GraphArena, GraphRef, NodeId};
use crate::partition::context::SubgraphContextStore;
use crate::partition::identity::identify;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Promotes unresolvable outer-scope references to top-level inputs
pub struct ScopeResolver;

impl ScopeResolver {
    /// Resolve outer-scope values for `built` against its authoritative
    /// `reference` graph
    ///
    /// Requires [`SubgraphContextStore::build`] to have run over the
    /// built graph first; a missing top-level context is an error.
    pub fn resolve(
        built_arena: &mut GraphArena,
        built: GraphRef,
        ref_arena: &GraphArena,
        reference: GraphRef,
        store: &mut SubgraphContextStore,
    ) -> Result<()> {
        // Match built nodes to reference nodes once per graph pair, then
        // recurse into paired subgraph attributes, innermost first.
        let correspondence = Self::correspondence(built_arena, built, ref_arena, reference);

        let mut pairs: Vec<(GraphRef, GraphRef)> = Vec::new();
        {
            let built_graph = built_arena.graph(built);
            let ref_graph = ref_arena.graph(reference);
            for node_id in built_graph.node_ids() {
                let Some(built_node) = built_graph.node(node_id) else {
                    continue;
                };
                // No counterpart in the reference graph: skip this node's
                // subgraphs entirely
                let Some(&ref_id) = correspondence.get(&node_id) else {
                    continue;
                };
                let Some(ref_node) = ref_graph.node(ref_id) else {
                    continue;
                };
                for (attr_name, built_sub) in built_node.subgraph_attributes() {
                    if let Some(crate::graph::Attribute::Subgraph(ref_sub)) =
                        ref_node.attribute(attr_name)
                    {
                        pairs.push((built_sub, *ref_sub));
                    }
                }
            }
        }
        for (built_sub, ref_sub) in pairs {
            Self::resolve(built_arena, built_sub, ref_arena, ref_sub, store)?;
        }

        // The root graph captures nothing; only parent-owned graphs have
        // outer-scope references to settle.
        if built_arena.graph(built).parent().is_none() {
            return Ok(());
        }

        // The reference parent node declares which outer-scope values flow
        // into its subgraphs.
        let implicit_inputs = {
            let ref_graph = ref_arena.graph(reference);
            match ref_graph.parent() {
                Some(link) => ref_arena
                    .graph(link.graph)
                    .node(link.node)
                    .map(|node| node.implicit_inputs.clone())
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        };

        let top_level = built_arena.top_level(built);
        let top_level_id = identify(built_arena.graph(top_level));
        if !store.contains(&top_level_id) {
            return Err(PartitionError::MissingContext(top_level_id.to_string()));
        }

        debug!(
            subgraph = built_arena.graph(built).name(),
            implicit = implicit_inputs.len(),
            "resolving outer-scope values"
        );

        for implicit in implicit_inputs {
            let name = implicit.name.clone();

            // The parent node's implicit inputs cover all of its subgraphs;
            // an "If" node carries captures for both branches. Only handle
            // the ones this subgraph actually mentions.
            if !built_arena.graph(built).has_value(&name) {
                continue;
            }
            built_arena.graph_mut(built).add_outer_scope_value(&name);
            debug!(value = %name, "used in this subgraph");

            // Already promoted for this top-level ancestor in a prior pass
            if store
                .context(&top_level_id)
                .is_some_and(|context| context.is_manually_added(&name))
            {
                debug!(value = %name, "already added as an explicit graph input");
                continue;
            }

            // Satisfiable through some enclosing scope of the built graph
            if store.is_outer_scope_value(built_arena, built, &name) {
                continue;
            }

            // The capture survives to the top level. Declare it there
            // unless the top-level graph already lists it as an input.
            let already_declared = built_arena
                .graph(top_level)
                .inputs_including_initializers()
                .iter()
                .any(|input| input.name == name);
            if already_declared {
                continue;
            }

            built_arena.graph_mut(top_level).register_value(implicit.clone());
            if let Some(context) = store.context_mut(&top_level_id) {
                context.add_manual_input(implicit);
            }
            debug!(value = %name, "added as an explicit input to the top-level graph");
        }

        Ok(())
    }

    /// Name-keyed node correspondence between the built graph and its
    /// reference, captured once per graph pair
    fn correspondence(
        built_arena: &GraphArena,
        built: GraphRef,
        ref_arena: &GraphArena,
        reference: GraphRef,
    ) -> FxHashMap<NodeId, NodeId> {
        let built_graph = built_arena.graph(built);
        let ref_graph = ref_arena.graph(reference);
        let mut map = FxHashMap::default();
        for node_id in built_graph.node_ids() {
            if let Some(node) = built_graph.node(node_id) {
                if node.name.is_empty() {
                    continue;
                }
                if let Some(ref_id) = ref_graph.node_id_by_name(&node.name) {
                    map.insert(node_id, ref_id);
                }
            }
        }
        map
    }
}
