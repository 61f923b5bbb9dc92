// Collaborator contracts at the crate boundary
//
// The partitioning core never compiles, validates, or probes hardware
// itself. Those concerns live behind the traits here, in-process only.

use crate::graph::{ComputationGraph, ConstantData, GraphArena, GraphRef};
use crate::partition::CandidateSubset;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

/// The accelerator backend's parser
///
/// Given a graph, proposes the node subsets it can compile. Parser
/// rejection is silent: unsupported nodes are simply absent from the
/// proposals, and a proposal may be a strict subset of what was hoped
/// for. That is data for augmentation, not an error.
pub trait AcceleratorBackend {
    fn supported_subsets(&mut self, graph: &ComputationGraph) -> Result<Vec<CandidateSubset>>;
}

/// Full structural validation of a constructed graph
///
/// Invoked once per graph after input normalization. Type and shape
/// inference, default input inference, and whatever else the host
/// runtime performs all live behind this seam; any failure is fatal to
/// compiling that graph.
pub trait GraphValidator {
    fn resolve(&mut self, arena: &GraphArena, graph: GraphRef) -> Result<()>;
}

/// Converts an out-of-line constant into a directly embedded one
///
/// Invoked by context building for every externally-sourced input. The
/// conversion is a one-way side effect with no rollback.
pub trait InlineMaterializer {
    fn materialize(&mut self, graph: &mut ComputationGraph, name: &str) -> Result<()>;
}

/// Inline materializer backed by files on disk
///
/// Constants stored out-of-line name a file relative to the model
/// directory plus an optional byte window. Names that are not
/// initializers of the graph are left alone; they refer to graph inputs
/// with nothing to embed.
pub struct FileBackedInliner {
    base_dir: Option<PathBuf>,
}

impl FileBackedInliner {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }
}

impl Default for FileBackedInliner {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineMaterializer for FileBackedInliner {
    fn materialize(&mut self, graph: &mut ComputationGraph, name: &str) -> Result<()> {
        let Some(tensor) = graph.initializer_mut(name) else {
            return Ok(());
        };
        let (location, offset, length) = match tensor.data() {
            ConstantData::Inline(_) => return Ok(()),
            ConstantData::External {
                location,
                offset,
                length,
            } => (location.clone(), *offset, *length),
        };

        let base_dir = self
            .base_dir
            .as_deref()
            .ok_or_else(|| anyhow!("constant '{}' is stored externally but no base directory is configured", name))?;
        let path = base_dir.join(&location);
        let file_data = std::fs::read(&path)
            .with_context(|| format!("failed to load external data from {}", path.display()))?;

        let start = offset as usize;
        let end = match length {
            Some(len) => start + len as usize,
            None => file_data.len(),
        };
        let bytes = file_data
            .get(start..end)
            .ok_or_else(|| {
                anyhow!(
                    "external data window {}..{} out of bounds for {} ({} bytes)",
                    start,
                    end,
                    path.display(),
                    file_data.len()
                )
            })?
            .to_vec();

        tensor.set_inline(bytes);
        Ok(())
    }
}

/// Reference validator that checks closure soundness
///
/// Every value a node consumes must resolve to a local producer, an
/// initializer, a declared input, or the same in some strictly enclosing
/// graph. Host runtimes with real type and shape inference replace this.
pub struct StructuralValidator;

impl StructuralValidator {
    fn resolvable(arena: &GraphArena, graph_ref: GraphRef, name: &str) -> bool {
        let graph = arena.graph(graph_ref);
        if graph.producer(name).is_some()
            || graph.is_constant_initializer(name)
            || graph
                .inputs_including_initializers()
                .iter()
                .any(|input| input.name == name)
        {
            return true;
        }
        match graph.parent() {
            Some(link) => Self::resolvable(arena, link.graph, name),
            None => false,
        }
    }
}

impl GraphValidator for StructuralValidator {
    fn resolve(&mut self, arena: &GraphArena, graph_ref: GraphRef) -> Result<()> {
        let graph = arena.graph(graph_ref);
        for node_id in graph.node_ids() {
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            for input in &node.input_names {
                if input.is_empty() {
                    continue;
                }
                if !Self::resolvable(arena, graph_ref, input) {
                    return Err(anyhow!(
                        "node '{}' in graph '{}' consumes unresolved value '{}'",
                        node.name,
                        graph.name(),
                        input
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Boolean feature flags reported by the host's CPU probe
///
/// Computed once at process start and read-only afterwards. Consumed by
/// kernel-selection logic outside this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    pub has_avx: bool,
    pub has_avx2: bool,
    pub has_avx512f: bool,
    pub has_f16c: bool,
    pub has_arm_neon_dot: bool,
    pub has_arm_neon_bf16: bool,
}

/// Read-only boundary to the host's CPU capability probe
pub trait CpuCapabilityProbe {
    fn features(&self) -> CpuFeatures;

    /// Index of the execution unit the calling thread runs on
    fn current_core(&self) -> usize;
}

/// Probe wired to precomputed values, for hosts that snapshot the CPU
/// state themselves at startup
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe {
    pub features: CpuFeatures,
    pub core: usize,
}

impl CpuCapabilityProbe for FixedProbe {
    fn features(&self) -> CpuFeatures {
        self.features
    }

    fn current_core(&self) -> usize {
        self.core
    }
}
