//! Targets under exploration and the queue that rotates through them.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

/// One program/harness being explored, with optional seed tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub seeds: Option<PathBuf>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seeds: None,
        }
    }

    #[must_use]
    pub fn with_seeds(mut self, dir: impl Into<PathBuf>) -> Self {
        self.seeds = Some(dir.into());
        self
    }

    /// Name safe to use as a single path component.
    pub fn dir_name(&self) -> String {
        let base = self.name.rsplit('/').next().unwrap_or(&self.name);
        base.replace(['\\', ':'], "_")
    }
}

/// Targets waiting to be explored, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct TargetQueue {
    pending: VecDeque<Target>,
}

impl TargetQueue {
    /// Pair each item with the seed directory at the same position, if any.
    pub fn from_items(items: &[String], seeds: &[PathBuf]) -> Self {
        let pending = items
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let target = Target::new(name.clone());
                match seeds.get(i) {
                    Some(dir) => target.with_seeds(dir.clone()),
                    None => target,
                }
            })
            .collect();
        Self { pending }
    }

    pub fn has_next(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn front(&self) -> Option<&Target> {
        self.pending.front()
    }

    pub fn pop(&mut self) -> Option<Target> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
