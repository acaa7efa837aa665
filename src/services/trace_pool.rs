//! Deduplicated store of traces produced for the current target.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::strategy::SelectionStrategy;
use crate::domain::models::trace::{Trace, TraceArtifact, TraceId};
use crate::services::cycle_finder::compress_blocks;
use crate::services::trace_graph::{InsertOutcome, TraceGraph};
use crate::services::trace_selector::{BlockWeights, TraceSelector};

/// Where and how the trace graph is exported after each novel insertion.
#[derive(Debug, Clone)]
pub struct GraphExport {
    pub dir: PathBuf,
    pub only_branches: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TracePoolOptions {
    pub compress: bool,
    pub export: Option<GraphExport>,
}

/// Trace graph plus the selection strategy and the stored trace directories.
#[derive(Debug)]
pub struct TracePool {
    graph: TraceGraph,
    selector: TraceSelector,
    weights: BlockWeights,
    artifacts: HashMap<TraceId, TraceArtifact>,
    /// Traces returned by [`Self::next`]; a worker may still hold them.
    handed_out: HashSet<TraceId>,
    /// Superseded traces whose directories wait for [`Self::reclaim`].
    retired: HashMap<TraceId, TraceArtifact>,
    options: TracePoolOptions,
    exports: usize,
    redundant: usize,
}

impl TracePool {
    pub fn new(strategy: SelectionStrategy, options: TracePoolOptions) -> Self {
        Self {
            graph: TraceGraph::new(),
            selector: TraceSelector::new(strategy),
            weights: BlockWeights::default(),
            artifacts: HashMap::new(),
            handed_out: HashSet::new(),
            retired: HashMap::new(),
            options,
            exports: 0,
            redundant: 0,
        }
    }

    /// Load the trace stored in `artifact` and merge it.
    ///
    /// A trace that is not novel has its directory removed. A trace that
    /// supersedes another reclaims the other's directory, unless the other
    /// was already handed out; that one is retired until [`Self::reclaim`].
    #[instrument(skip(self), fields(trace = %artifact.id))]
    pub fn insert(&mut self, artifact: TraceArtifact) -> DomainResult<InsertOutcome> {
        let trace = artifact.load_trace()?;
        let outcome = self.insert_trace(&trace)?;
        if outcome.is_novel() {
            self.artifacts.insert(artifact.id.clone(), artifact);
        } else {
            remove_dir(&artifact.dir);
        }
        Ok(outcome)
    }

    /// Merge an in-memory trace.
    pub fn insert_trace(&mut self, trace: &Trace) -> DomainResult<InsertOutcome> {
        let compressed;
        let trace = if self.options.compress {
            compressed = trace.clone().with_blocks(compress_blocks(trace.blocks()))?;
            &compressed
        } else {
            trace
        };

        let outcome = self.graph.insert(trace)?;
        match &outcome {
            InsertOutcome::Redundant => {
                self.redundant += 1;
                debug!(trace = trace.id(), "trace discarded as redundant");
                return Ok(outcome);
            }
            InsertOutcome::Superseded { replaced } => {
                self.selector.retract(replaced);
                if let Some(old) = self.artifacts.remove(replaced) {
                    if self.handed_out.remove(replaced) {
                        debug!(trace = %replaced, "superseded trace retired");
                        self.retired.insert(replaced.clone(), old);
                    } else {
                        remove_dir(&old.dir);
                    }
                }
            }
            InsertOutcome::Novel => {}
        }

        self.weights.record(trace.blocks());
        self.selector.submit(trace);
        self.export_graph();
        Ok(outcome)
    }

    /// Select the next trace and return its stored directory.
    pub fn next(&mut self) -> DomainResult<Option<TraceArtifact>> {
        let Some(id) = self.next_id()? else {
            return Ok(None);
        };
        let artifact = self
            .artifacts
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::GraphConsistency(format!("trace {id} has no stored directory")))?;
        self.handed_out.insert(id);
        Ok(Some(artifact))
    }

    /// Remove the directories of retired traces no longer in `held`.
    pub fn reclaim(&mut self, held: &HashSet<TraceId>) -> usize {
        let before = self.retired.len();
        self.retired.retain(|id, artifact| {
            if held.contains(id) {
                return true;
            }
            remove_dir(&artifact.dir);
            false
        });
        before - self.retired.len()
    }

    /// Superseded traces whose directories are still in use.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Select the next trace id, marking it executed.
    pub fn next_id(&mut self) -> DomainResult<Option<TraceId>> {
        let Some(id) = self.selector.next(&mut self.graph, &self.weights) else {
            return Ok(None);
        };
        if !matches!(self.selector, TraceSelector::Bfs | TraceSelector::RecursiveDescent) {
            self.graph.mark_executed(&id)?;
        }
        Ok(Some(id))
    }

    /// Live deduplicated traces.
    pub fn count_all_unique(&self) -> usize {
        self.graph.trace_count()
    }

    /// Traces not yet handed out.
    pub fn count_next(&self) -> usize {
        self.selector.pending(&self.graph)
    }

    pub fn redundant_count(&self) -> usize {
        self.redundant
    }

    pub fn blocks_discovered(&self) -> usize {
        self.weights.discovered()
    }

    pub const fn graph(&self) -> &TraceGraph {
        &self.graph
    }

    /// Redirect graph exports, e.g. to a new target's directory.
    pub fn set_export(&mut self, export: Option<GraphExport>) {
        self.options.export = export;
        self.exports = 0;
    }

    /// Forget every trace, keeping strategy and options.
    pub fn clear(&mut self) {
        self.graph.clear();
        self.selector.clear();
        self.weights.clear();
        self.artifacts.clear();
        self.handed_out.clear();
        self.retired.clear();
        self.exports = 0;
        self.redundant = 0;
    }

    fn export_graph(&mut self) {
        let Some(export) = &self.options.export else {
            return;
        };
        self.exports += 1;
        let path = export.dir.join(format!("{}.dot", self.exports));
        let dot = self.graph.to_dot(export.only_branches);
        if let Err(e) = std::fs::create_dir_all(&export.dir).and_then(|()| std::fs::write(&path, dot)) {
            warn!(path = %path.display(), error = %e, "failed to export trace graph");
        }
    }
}

fn remove_dir(dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to reclaim trace directory");
        }
    }
}
