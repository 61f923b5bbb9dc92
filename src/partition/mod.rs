//! Partitioning passes and the single-pass driver
//!
//! The passes run in a fixed order over one partitioning attempt:
//!
//! ```text
//! Graph pair (built + reference)
//!     ↓
//! 1. Context build → per-graph scope records, innermost first
//!     ↓
//! 2. Scope resolution → lost captures promoted to top-level inputs
//!     ↓
//! 3. Input normalization → one final declared-input list per graph
//!     ↓
//! 4. Validation → collaborator checks every constructed graph
//!     ↓
//! 5. Selection → auxiliary pattern scan + backend proposals
//!     ↓
//! 6. Augmentation → filtered auxiliaries re-admitted, capabilities built
//! ```
//!
//! Everything is synchronous and single-threaded; the context store is
//! created fresh for each attempt and discarded with it. Hosts that
//! partition independent top-level graphs in parallel must use one
//! [`Partitioner`] call per graph.

pub mod auxiliary;
pub mod capability;
pub mod context;
pub mod identity;
pub mod inputs;
pub mod scope;

pub use auxiliary::{AuxiliaryNodeSelector, AuxiliaryPattern, AuxiliarySelection};
pub use capability::{augment, reconcile, CandidateSubset, ComputeCapability, OptimizationFn};
pub use context::{OrderedValueSet, SubGraphContext, SubgraphContextStore};
pub use identity::{identify, GraphId};
pub use inputs::InputNormalizer;
pub use scope::ScopeResolver;

use crate::backend::{AcceleratorBackend, GraphValidator, InlineMaterializer};
use crate::error::{PartitionError, Result};
use crate::graph::{GraphArena, GraphRef};
use tracing::debug;

/// External collaborators one partitioning attempt talks to
pub struct Collaborators<'a> {
    pub backend: &'a mut dyn AcceleratorBackend,
    pub validator: &'a mut dyn GraphValidator,
    pub materializer: &'a mut dyn InlineMaterializer,
}

/// Everything a completed attempt produced
#[derive(Debug)]
pub struct PartitionOutcome {
    /// One capability per accepted backend proposal, after augmentation
    pub capabilities: Vec<ComputeCapability>,
    /// Reconciled optimization capabilities, present when a selection
    /// capability was configured
    pub optimizations: Vec<ComputeCapability>,
    /// The auxiliary scan the attempt worked from
    pub auxiliary: AuxiliarySelection,
    /// The backend proposals as augmented, accepted and rejected alike
    pub subsets: Vec<CandidateSubset>,
}

/// Single-pass partitioning driver
///
/// Configure once, then run [`Partitioner::partition`] per top-level
/// graph. Each run owns an isolated context store; a failed run leaves
/// the built arena unusable for further attempts and should be rebuilt
/// from the reference.
pub struct Partitioner {
    pattern: AuxiliaryPattern,
    selection: Option<ComputeCapability>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self {
            pattern: AuxiliaryPattern::default(),
            selection: None,
        }
    }

    /// Override the auxiliary-node pattern
    pub fn with_pattern(mut self, pattern: AuxiliaryPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Provide the standing selection capability to reconcile backend
    /// proposals against
    pub fn with_selection_capability(mut self, selection: ComputeCapability) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Run one partitioning attempt
    ///
    /// `built` mirrors `reference` but may be missing closure captures;
    /// the reference stays authoritative and untouched.
    pub fn partition(
        &self,
        built: &mut GraphArena,
        built_root: GraphRef,
        reference: &GraphArena,
        reference_root: GraphRef,
        collaborators: &mut Collaborators<'_>,
    ) -> Result<PartitionOutcome> {
        let mut store = SubgraphContextStore::new();

        store.build(built, built_root, collaborators.materializer)?;
        ScopeResolver::resolve(built, built_root, reference, reference_root, &mut store)?;

        for graph_ref in built.graph_refs() {
            InputNormalizer::finalize(built, graph_ref, &store);
        }
        for graph_ref in built.graph_refs() {
            collaborators
                .validator
                .resolve(built, graph_ref)
                .map_err(|err| PartitionError::Validation(err.to_string()))?;
        }

        let auxiliary =
            AuxiliaryNodeSelector::select(built.graph(built_root), &self.pattern)?;
        let mut subsets = collaborators
            .backend
            .supported_subsets(built.graph(built_root))
            .map_err(|err| PartitionError::Backend(err.to_string()))?;
        debug!(proposals = subsets.len(), "backend proposals received");

        // Augment each proposal against a snapshot of the whole collection,
        // so an auxiliary covered anywhere is never re-admitted twice
        for index in 0..subsets.len() {
            let snapshot = subsets.clone();
            augment(
                built.graph(built_root),
                &mut subsets[index],
                &snapshot,
                &auxiliary.consumer_to_auxiliary,
            )?;
        }

        let mut capabilities = Vec::new();
        for subset in subsets.iter().filter(|subset| subset.accepted) {
            capabilities.push(subset.to_capability(built.graph(built_root))?);
        }

        let mut optimizations = Vec::new();
        if let Some(selection) = &self.selection {
            for capability in &capabilities {
                optimizations.push(reconcile(selection, &auxiliary.selected, capability));
            }
        }

        Ok(PartitionOutcome {
            capabilities,
            optimizations,
            auxiliary,
            subsets,
        })
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new()
    }
}
