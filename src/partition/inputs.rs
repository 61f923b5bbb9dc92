// Final graph-input reconciliation
//
// Scope resolution may have planted synthetic inputs in a graph's
// context. Validation infers declared inputs only for graphs that were
// left untouched, so any graph with manual additions needs its full
// input list assembled here before it is handed to the validator.

use crate::graph::{GraphArena, GraphRef};
use crate::partition::context::{OrderedValueSet, SubgraphContextStore};
use crate::partition::identity::identify;

/// Reconciles declared and manually-promoted inputs into one list
pub struct InputNormalizer;

impl InputNormalizer {
    /// Produce the graph's final declared-input list
    ///
    /// A no-op when the context recorded no manually-added inputs; the
    /// surrounding validation collaborator infers inputs on its own in
    /// that case. Otherwise the list is the name-deduplicated
    /// concatenation, in insertion order, of the context's recorded
    /// inputs and initializers, then its manual additions, then whatever
    /// the graph already declared. The ordering is a determinism choice,
    /// not a correctness requirement, and must stay stable across runs.
    pub fn finalize(arena: &mut GraphArena, graph_ref: GraphRef, store: &SubgraphContextStore) {
        let graph_id = identify(arena.graph(graph_ref));
        let Some(context) = store.context(&graph_id) else {
            return;
        };
        if context.manually_added_inputs().is_empty() {
            return;
        }

        let mut finalized = OrderedValueSet::default();
        for desc in context.inputs_and_initializers().iter() {
            finalized.insert(desc.clone());
        }
        for desc in context.manually_added_inputs().iter() {
            finalized.insert(desc.clone());
        }
        for desc in arena.graph(graph_ref).inputs_including_initializers() {
            finalized.insert(desc.clone());
        }

        arena.graph_mut(graph_ref).set_inputs(finalized.into_vec());
    }
}
