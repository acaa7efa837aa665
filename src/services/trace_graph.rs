//! Union of all submitted traces as one shared prefix tree.
//!
//! Vertices live in an arena addressed by index. Index 0 is a sentinel root
//! without a block, so traces whose first blocks differ become sibling
//! branches. Every root-to-leaf path reproduces exactly one live trace and
//! every vertex names the trace that owns it.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};

use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::trace::{Block, Trace, TraceId};

/// Index of a vertex in the arena.
pub type VertexId = usize;

/// The sentinel root vertex.
pub const ROOT: VertexId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    /// `None` only for the root.
    pub block: Option<Block>,
    /// Trace this vertex currently belongs to; `None` only for the root.
    pub trace_id: Option<TraceId>,
    /// Out-degree greater than one.
    pub branch: bool,
}

/// Result of submitting a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new branch was added.
    Novel,
    /// The trace extends a previously complete trace, which was removed.
    Superseded { replaced: TraceId },
    /// The trace is already known or is a prefix of a known path.
    Redundant,
}

impl InsertOutcome {
    pub const fn is_novel(&self) -> bool {
        !matches!(self, Self::Redundant)
    }
}

type SupersededHook = Box<dyn FnMut(&str) + Send>;

/// Prefix tree of block sequences with per-trace execution state.
pub struct TraceGraph {
    vertices: Vec<Vertex>,
    children: Vec<Vec<VertexId>>,
    parents: Vec<Option<VertexId>>,
    /// Live traces and the leaf vertex that ends each of them.
    leaves: HashMap<TraceId, VertexId>,
    executed: HashMap<TraceId, bool>,
    last_selected: Option<TraceId>,
    hooks: Vec<SupersededHook>,
}

impl fmt::Debug for TraceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceGraph")
            .field("vertices", &self.vertices.len())
            .field("traces", &self.leaves.len())
            .field("last_selected", &self.last_selected)
            .finish_non_exhaustive()
    }
}

impl Default for TraceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceGraph {
    pub fn new() -> Self {
        Self {
            vertices: vec![Vertex {
                block: None,
                trace_id: None,
                branch: false,
            }],
            children: vec![Vec::new()],
            parents: vec![None],
            leaves: HashMap::new(),
            executed: HashMap::new(),
            last_selected: None,
            hooks: Vec::new(),
        }
    }

    /// Register a callback invoked with the id of every superseded trace.
    pub fn on_superseded(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Merge `trace` into the graph.
    pub fn insert(&mut self, trace: &Trace) -> DomainResult<InsertOutcome> {
        if self.leaves.contains_key(trace.id()) {
            return Ok(InsertOutcome::Redundant);
        }

        let blocks = trace.blocks();
        let (divergence, matched) = self.find_divergence(blocks);

        if matched == blocks.len() {
            debug!(trace = trace.id(), "trace is a subgraph of known paths");
            return Ok(InsertOutcome::Redundant);
        }

        let mut outcome = InsertOutcome::Novel;
        if divergence != ROOT && self.children[divergence].is_empty() {
            let replaced = self.back_insert(divergence, trace.id())?;
            outcome = InsertOutcome::Superseded { replaced };
        }

        let leaf = self.append_chain(divergence, &blocks[matched..], trace.id());
        self.leaves.insert(trace.id().to_string(), leaf);
        self.executed.insert(trace.id().to_string(), false);
        self.vertices[divergence].branch = divergence != ROOT && self.children[divergence].len() > 1;

        if let InsertOutcome::Superseded { replaced } = &outcome {
            debug!(trace = trace.id(), replaced = %replaced, "trace supersedes shorter path");
            for hook in &mut self.hooks {
                hook(replaced.as_str());
            }
        }
        Ok(outcome)
    }

    /// Walk from the root following `blocks`; returns the last matching
    /// vertex and how many blocks matched.
    fn find_divergence(&self, blocks: &[Block]) -> (VertexId, usize) {
        let mut current = ROOT;
        let mut matched = 0;
        while let Some(block) = blocks.get(matched) {
            let next = self.children[current]
                .iter()
                .copied()
                .find(|&c| self.vertices[c].block == Some(*block));
            match next {
                Some(child) => {
                    current = child;
                    matched += 1;
                }
                None => break,
            }
        }
        (current, matched)
    }

    /// Relabel the tail of the path ending at `leaf` to `new_id` and drop the
    /// trace that owned it.
    fn back_insert(&mut self, leaf: VertexId, new_id: &str) -> DomainResult<TraceId> {
        let previous = self.vertices[leaf].trace_id.clone().ok_or_else(|| {
            DomainError::GraphConsistency(format!("leaf vertex {leaf} has no owning trace"))
        })?;
        if self.leaves.remove(&previous).is_none() {
            return Err(DomainError::GraphConsistency(format!(
                "superseded trace {previous} is not registered"
            )));
        }
        self.executed.remove(&previous);
        if self.last_selected.as_deref() == Some(previous.as_str()) {
            self.last_selected = None;
        }

        let mut cursor = Some(leaf);
        while let Some(v) = cursor {
            if self.vertices[v].trace_id.as_deref() != Some(previous.as_str()) {
                break;
            }
            self.vertices[v].trace_id = Some(new_id.to_string());
            cursor = self.parents[v];
        }
        Ok(previous)
    }

    fn append_chain(&mut self, from: VertexId, blocks: &[Block], id: &str) -> VertexId {
        let mut parent = from;
        for block in blocks {
            let v = self.vertices.len();
            self.vertices.push(Vertex {
                block: Some(*block),
                trace_id: Some(id.to_string()),
                branch: false,
            });
            self.children.push(Vec::new());
            self.parents.push(Some(parent));
            self.children[parent].push(v);
            parent = v;
        }
        parent
    }

    pub fn contains(&self, id: &str) -> bool {
        self.leaves.contains_key(id)
    }

    /// Number of live (deduplicated) traces.
    pub fn trace_count(&self) -> usize {
        self.leaves.len()
    }

    /// Number of vertices, excluding the root.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() - 1
    }

    pub fn branch_count(&self) -> usize {
        self.vertices.iter().filter(|v| v.branch).count()
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    pub fn children(&self, id: VertexId) -> &[VertexId] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    /// Rebuild the block sequence of a live trace from its path.
    pub fn path_blocks(&self, id: &str) -> Option<Vec<Block>> {
        let mut cursor = Some(*self.leaves.get(id)?);
        let mut blocks = Vec::new();
        while let Some(v) = cursor {
            if let Some(block) = self.vertices[v].block {
                blocks.push(block);
            }
            cursor = self.parents[v];
        }
        blocks.reverse();
        Some(blocks)
    }

    pub fn is_executed(&self, id: &str) -> Option<bool> {
        self.executed.get(id).copied()
    }

    /// Record that a trace has been handed out for symbolic execution.
    pub fn mark_executed(&mut self, id: &str) -> DomainResult<()> {
        let entry = self.executed.get_mut(id).ok_or_else(|| {
            DomainError::GraphConsistency(format!("trace {id} is not in the graph"))
        })?;
        *entry = true;
        self.last_selected = Some(id.to_string());
        Ok(())
    }

    /// Live traces not yet handed out.
    pub fn pending_count(&self) -> usize {
        self.executed.values().filter(|done| !**done).count()
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.last_selected.as_deref()
    }

    /// Breadth-first from the root; the first vertex whose trace is not yet
    /// executed selects that trace.
    pub fn next_bfs(&mut self) -> Option<TraceId> {
        let mut queue: VecDeque<VertexId> = self.children[ROOT].iter().copied().collect();
        while let Some(v) = queue.pop_front() {
            if let Some(id) = &self.vertices[v].trace_id {
                if self.executed.get(id) == Some(&false) {
                    let id = id.clone();
                    self.executed.insert(id.clone(), true);
                    self.last_selected = Some(id.clone());
                    return Some(id);
                }
            }
            queue.extend(self.children[v].iter().copied());
        }
        None
    }

    /// Descend from the root, entering at each branch point the child
    /// subtree with the lowest `score` over its blocks first and backtracking
    /// out of fully executed subtrees.
    pub fn next_recursive<F>(&mut self, score: F) -> Option<TraceId>
    where
        F: Fn(&[Block]) -> f64,
    {
        let id = self.descend(ROOT, &score)?;
        self.executed.insert(id.clone(), true);
        self.last_selected = Some(id.clone());
        Some(id)
    }

    fn descend<F>(&self, start: VertexId, score: &F) -> Option<TraceId>
    where
        F: Fn(&[Block]) -> f64,
    {
        let mut v = start;
        while self.children[v].len() == 1 {
            v = self.children[v][0];
        }

        if self.children[v].is_empty() {
            let id = self.vertices[v].trace_id.as_ref()?;
            return (self.executed.get(id) == Some(&false)).then(|| id.clone());
        }

        let mut scored: Vec<(f64, VertexId)> = self.children[v]
            .iter()
            .map(|&c| (score(&self.subtree_blocks(c)), c))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        scored.into_iter().find_map(|(_, child)| self.descend(child, score))
    }

    fn subtree_blocks(&self, start: VertexId) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut stack = vec![start];
        while let Some(v) = stack.pop() {
            if let Some(block) = self.vertices[v].block {
                blocks.push(block);
            }
            stack.extend(self.children[v].iter().copied());
        }
        blocks
    }

    /// Edges between branch points and leaves, skipping straight-line runs.
    pub fn compress_to_branches(&self) -> Vec<(VertexId, VertexId)> {
        let mut edges = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(v) = stack.pop() {
            for &child in &self.children[v] {
                let end = self.next_branch_or_leaf(child);
                edges.push((v, end));
                stack.push(end);
            }
        }
        edges.sort_unstable();
        edges
    }

    fn next_branch_or_leaf(&self, mut v: VertexId) -> VertexId {
        while self.children[v].len() == 1 {
            v = self.children[v][0];
        }
        v
    }

    /// Graphviz rendering; with `only_branches` straight-line runs collapse
    /// into single edges.
    pub fn to_dot(&self, only_branches: bool) -> String {
        let edges: Vec<(VertexId, VertexId)> = if only_branches {
            self.compress_to_branches()
        } else {
            (1..self.vertices.len())
                .filter_map(|v| self.parents[v].map(|p| (p, v)))
                .collect()
        };

        let mut out = String::from("digraph trace_graph {\n");
        let mut labelled = std::collections::HashSet::new();
        for &(from, to) in &edges {
            for v in [from, to] {
                if labelled.insert(v) {
                    let _ = writeln!(out, "  {v} [label=\"{}\"{}];", self.label(v), self.style(v));
                }
            }
            let _ = writeln!(out, "  {from} -> {to};");
        }
        out.push_str("}\n");
        out
    }

    fn label(&self, v: VertexId) -> String {
        match self.vertices[v].block {
            Some(block) => format!("{block:#x}"),
            None => "root".to_string(),
        }
    }

    fn style(&self, v: VertexId) -> &'static str {
        if self.vertices[v].branch {
            ", shape=diamond"
        } else if self.children[v].is_empty() && v != ROOT {
            ", shape=box"
        } else {
            ""
        }
    }

    /// Forget every vertex and trace; subscribers stay registered.
    pub fn clear(&mut self) {
        let hooks = std::mem::take(&mut self.hooks);
        *self = Self::new();
        self.hooks = hooks;
    }
}
