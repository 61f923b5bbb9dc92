// Content-stable graph identity
//
// Repeated analysis passes over equivalent graphs must converge to the
// same subgraph context, so a graph's identity is derived from its
// structural content rather than from arena position or pointer identity.

use crate::graph::ComputationGraph;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Content-derived identity of a graph
///
/// Combines the declared graph name with a hash folded over every live
/// node's name. Two graphs with the same declared name and the same
/// node-name multiset share an identity by design; the identity only
/// deduplicates context-building work, it is not a semantic key across
/// unrelated graphs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(String);

impl GraphId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the unique name for a graph from its declared name and the
/// names of all its live nodes
///
/// Each node name is run through a streaming hasher and the results are
/// accumulated with XOR, so the identity does not depend on node order
/// and is unaffected by tombstoned slots.
pub fn identify(graph: &ComputationGraph) -> GraphId {
    let mut accumulated: u64 = 0;
    for node_id in graph.node_ids() {
        if let Some(node) = graph.node(node_id) {
            let mut hasher = ahash::AHasher::default();
            node.name.hash(&mut hasher);
            accumulated ^= hasher.finish();
        }
    }
    GraphId(format!("{}_{}", graph.name(), accumulated))
}
