// Graph module for the offload partitioner
//
// This module provides the intermediate representation the partitioning
// passes operate on:
// - A nested-graph arena: graphs owned by control-flow node attributes,
//   with non-owning parent back-links forming a tree
// - Sparse node storage with stable indices and tombstoned removal slots
// - Name-keyed producer and value tables for data-flow queries
//
// The IR separates graph structure from tensor data. Constant payloads are
// carried as opaque bytes, inline or out-of-line, so that inline
// materialization can be modeled without committing to a numeric format.

pub mod ir;

// Re-exports for convenience
pub use ir::{
    Attribute, ComputationGraph, ConstantData, ConstantTensor, DataFlow, ElementType, GraphArena,
    GraphRef, NewOp, NodeId, OpNode, ParentLink, ValueDesc,
};
