//! Strategies choosing the next trace handed to a symbolic worker.

use std::collections::{HashMap, VecDeque};

use crate::domain::models::strategy::SelectionStrategy;
use crate::domain::models::trace::{Block, Trace, TraceId};
use crate::services::trace_graph::TraceGraph;

/// Execution counts of every block across all submitted traces.
#[derive(Debug, Clone, Default)]
pub struct BlockWeights {
    counts: HashMap<Block, u64>,
}

impl BlockWeights {
    pub fn record(&mut self, blocks: &[Block]) {
        for block in blocks {
            *self.counts.entry(*block).or_insert(0) += 1;
        }
    }

    pub fn weight(&self, block: Block) -> u64 {
        self.counts.get(&block).copied().unwrap_or(0)
    }

    /// Distinct blocks seen so far.
    pub fn discovered(&self) -> usize {
        self.counts.len()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Global block frequency summed over `blocks`, divided by their count.
pub fn least_treaded_score(blocks: &[Block], weights: &BlockWeights) -> f64 {
    if blocks.is_empty() {
        return 0.0;
    }
    let total: u64 = blocks.iter().map(|b| weights.weight(*b)).sum();
    total as f64 / blocks.len() as f64
}

/// Count of occurrences of every block appearing more than once in `blocks`.
pub fn weight_group_score(blocks: &[Block]) -> u64 {
    let mut local: HashMap<Block, u64> = HashMap::new();
    for block in blocks {
        *local.entry(*block).or_insert(0) += 1;
    }
    local.values().filter(|count| **count >= 2).sum()
}

/// A pending trace kept by the scoring strategies.
#[derive(Debug, Clone)]
pub struct Candidate {
    id: TraceId,
    blocks: Vec<Block>,
    group_score: u64,
}

/// Selection state for one run.
///
/// Graph-walking strategies keep their pending set in the [`TraceGraph`];
/// the others keep their own.
#[derive(Debug, Clone)]
pub enum TraceSelector {
    Fifo(VecDeque<TraceId>),
    Bfs,
    RecursiveDescent,
    LeastTreaded(Vec<Candidate>),
    WeightGroup(Vec<Candidate>),
}

impl TraceSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        match strategy {
            SelectionStrategy::Fifo => Self::Fifo(VecDeque::new()),
            SelectionStrategy::Bfs => Self::Bfs,
            SelectionStrategy::RecursiveDescent => Self::RecursiveDescent,
            SelectionStrategy::LeastTreaded => Self::LeastTreaded(Vec::new()),
            SelectionStrategy::WeightGroup => Self::WeightGroup(Vec::new()),
        }
    }

    pub const fn strategy(&self) -> SelectionStrategy {
        match self {
            Self::Fifo(_) => SelectionStrategy::Fifo,
            Self::Bfs => SelectionStrategy::Bfs,
            Self::RecursiveDescent => SelectionStrategy::RecursiveDescent,
            Self::LeastTreaded(_) => SelectionStrategy::LeastTreaded,
            Self::WeightGroup(_) => SelectionStrategy::WeightGroup,
        }
    }

    /// Make a novel trace available for selection.
    pub fn submit(&mut self, trace: &Trace) {
        match self {
            Self::Fifo(queue) => queue.push_back(trace.id().to_string()),
            Self::Bfs | Self::RecursiveDescent => {}
            Self::LeastTreaded(pending) | Self::WeightGroup(pending) => pending.push(Candidate {
                id: trace.id().to_string(),
                blocks: trace.blocks().to_vec(),
                group_score: weight_group_score(trace.blocks()),
            }),
        }
    }

    /// Withdraw a trace that is no longer live.
    pub fn retract(&mut self, id: &str) {
        match self {
            Self::Fifo(queue) => queue.retain(|t| t != id),
            Self::Bfs | Self::RecursiveDescent => {}
            Self::LeastTreaded(pending) | Self::WeightGroup(pending) => {
                pending.retain(|c| c.id != id);
            }
        }
    }

    /// Pick the next trace. Graph strategies mark it executed in `graph`.
    pub fn next(&mut self, graph: &mut TraceGraph, weights: &BlockWeights) -> Option<TraceId> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::Bfs => graph.next_bfs(),
            Self::RecursiveDescent => {
                graph.next_recursive(|blocks| least_treaded_score(blocks, weights))
            }
            Self::LeastTreaded(pending) => {
                let pick = pending
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        least_treaded_score(&a.blocks, weights)
                            .total_cmp(&least_treaded_score(&b.blocks, weights))
                    })
                    .map(|(i, _)| i)?;
                Some(pending.remove(pick).id)
            }
            Self::WeightGroup(pending) => {
                // Ties go to the earliest submission.
                let mut pick: Option<(usize, u64)> = None;
                for (i, c) in pending.iter().enumerate() {
                    if pick.is_none_or(|(_, best)| c.group_score > best) {
                        pick = Some((i, c.group_score));
                    }
                }
                let (i, _) = pick?;
                Some(pending.remove(i).id)
            }
        }
    }

    /// Traces still waiting to be selected.
    pub fn pending(&self, graph: &TraceGraph) -> usize {
        match self {
            Self::Fifo(queue) => queue.len(),
            Self::Bfs | Self::RecursiveDescent => graph.pending_count(),
            Self::LeastTreaded(pending) | Self::WeightGroup(pending) => pending.len(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.strategy());
    }
}
