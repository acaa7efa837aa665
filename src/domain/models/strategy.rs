//! Selection strategies shared by trace selection and test ordering.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::{DomainError, DomainResult};

/// How pending work is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Submission order.
    Fifo,
    /// Breadth-first over the trace graph, or by last-visited node for tests.
    Bfs,
    /// Lowest global block-frequency score first.
    LeastTreaded,
    /// Descend the trace graph into the least explored subtree.
    RecursiveDescent,
    /// Score by blocks repeated within a trace.
    WeightGroup,
}

impl SelectionStrategy {
    pub const ALL: [Self; 5] = [
        Self::Fifo,
        Self::Bfs,
        Self::LeastTreaded,
        Self::RecursiveDescent,
        Self::WeightGroup,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Bfs => "bfs",
            Self::LeastTreaded => "least-treaded",
            Self::RecursiveDescent => "recursive-descent",
            Self::WeightGroup => "weight-group",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fifo" => Some(Self::Fifo),
            "bfs" => Some(Self::Bfs),
            "least-treaded" | "weighted" => Some(Self::LeastTreaded),
            "recursive-descent" | "exp-2" => Some(Self::RecursiveDescent),
            "weight-group" | "exp-1" => Some(Self::WeightGroup),
            _ => None,
        }
    }

    /// Parse a strategy name, failing on unknown names.
    pub fn parse(s: &str) -> DomainResult<Self> {
        Self::from_str(s).ok_or_else(|| DomainError::InvalidStrategy(s.to_string()))
    }

    /// Whether the strategy can order test cases (which have no graph).
    pub const fn orders_tests(&self) -> bool {
        matches!(self, Self::Fifo | Self::Bfs)
    }
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::Fifo
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for strategy in SelectionStrategy::ALL {
            assert_eq!(SelectionStrategy::from_str(strategy.as_str()), Some(strategy));
        }
    }

    #[test]
    fn test_legacy_aliases() {
        assert_eq!(
            SelectionStrategy::parse("exp-1").unwrap(),
            SelectionStrategy::WeightGroup
        );
        assert_eq!(
            SelectionStrategy::parse("weighted").unwrap(),
            SelectionStrategy::LeastTreaded
        );
        assert!(matches!(
            SelectionStrategy::parse("random"),
            Err(DomainError::InvalidStrategy(_))
        ));
    }

    #[test]
    fn test_only_fifo_and_bfs_order_tests() {
        assert!(SelectionStrategy::Bfs.orders_tests());
        assert!(!SelectionStrategy::WeightGroup.orders_tests());
    }
}
