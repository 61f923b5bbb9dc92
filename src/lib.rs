//! Subgraph partitioning and scope resolution for accelerator offload
//!
//! This crate prepares fragments of a nested computation graph for
//! offload to an external accelerator backend. Given a graph that may
//! contain control-flow nodes owning nested subgraphs, it identifies
//! which node subsets are self-contained units a backend can compile,
//! resolves the outer-scope references nested subgraphs make into
//! enclosing scopes, and reconciles independently computed node
//! selections into one backend-submittable unit.
//!
//! # Example
//!
//! ```no_run
//! use offload_partitioner::backend::{FileBackedInliner, StructuralValidator};
//! use offload_partitioner::partition::{Collaborators, Partitioner};
//! # use offload_partitioner::backend::AcceleratorBackend;
//! # use offload_partitioner::graph::{ComputationGraph, GraphArena};
//! # use offload_partitioner::partition::CandidateSubset;
//! # struct MyBackend;
//! # impl AcceleratorBackend for MyBackend {
//! #     fn supported_subsets(&mut self, _: &ComputationGraph) -> anyhow::Result<Vec<CandidateSubset>> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//! # let mut built = GraphArena::new();
//! # let built_root = built.add_graph("main");
//! # let reference = GraphArena::new();
//! # let reference_root = built_root;
//!
//! let mut backend = MyBackend;
//! let mut validator = StructuralValidator;
//! let mut materializer = FileBackedInliner::with_base_dir("model_dir");
//! let mut collaborators = Collaborators {
//!     backend: &mut backend,
//!     validator: &mut validator,
//!     materializer: &mut materializer,
//! };
//!
//! let outcome = Partitioner::new().partition(
//!     &mut built,
//!     built_root,
//!     &reference,
//!     reference_root,
//!     &mut collaborators,
//! )?;
//! # Ok::<(), offload_partitioner::PartitionError>(())
//! ```

pub mod backend;
pub mod error;
pub mod graph;
pub mod partition;

pub use error::{PartitionError, Result};
pub use graph::{
    Attribute, ComputationGraph, ConstantData, ConstantTensor, ElementType, GraphArena, GraphRef,
    NodeId, OpNode, ValueDesc,
};
pub use partition::{
    identify, AuxiliaryPattern, AuxiliarySelection, CandidateSubset, Collaborators,
    ComputeCapability, GraphId, PartitionOutcome, Partitioner, SubGraphContext,
    SubgraphContextStore,
};
