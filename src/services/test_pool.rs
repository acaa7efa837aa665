//! Store of test cases for the current target.
//!
//! Accepted test cases get sequential issue indices and are persisted under
//! `test-case/<index>` before being queued. Base test cases used to resolve
//! patches are cached in memory and persisted under `test-case-base/`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::strategy::SelectionStrategy;
use crate::domain::models::test_case::{IssueIndex, TestCase};

/// Outcome of offering a test case to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accepted and queued under the given issue index.
    Accepted(IssueIndex),
    /// Content identical to an already issued test case.
    Duplicate,
}

/// Ready queue ordering.
#[derive(Debug)]
enum ReadyQueue {
    Fifo(VecDeque<TestCase>),
    /// Smallest last-visited-node index first, then arrival order.
    Bfs(BinaryHeap<Reverse<(usize, u64, IssueIndex)>>, HashMap<IssueIndex, TestCase>),
}

impl ReadyQueue {
    fn new(strategy: SelectionStrategy) -> DomainResult<Self> {
        match strategy {
            SelectionStrategy::Fifo => Ok(Self::Fifo(VecDeque::new())),
            SelectionStrategy::Bfs => Ok(Self::Bfs(BinaryHeap::new(), HashMap::new())),
            other => Err(DomainError::InvalidStrategy(format!(
                "{other} cannot order test cases"
            ))),
        }
    }

    fn push(&mut self, tc: TestCase, arrival: u64, index: IssueIndex) {
        match self {
            Self::Fifo(queue) => queue.push_back(tc),
            Self::Bfs(heap, cases) => {
                heap.push(Reverse((tc.trace_tag().last_node_index(), arrival, index)));
                cases.insert(index, tc);
            }
        }
    }

    fn pop(&mut self) -> Option<TestCase> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::Bfs(heap, cases) => {
                let Reverse((_, _, index)) = heap.pop()?;
                cases.remove(&index)
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Fifo(queue) => queue.len(),
            Self::Bfs(_, cases) => cases.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Fifo(queue) => queue.clear(),
            Self::Bfs(heap, cases) => {
                heap.clear();
                cases.clear();
            }
        }
    }
}

/// Deduplicating, persisting test case store.
#[derive(Debug)]
pub struct TestPool {
    accepted_dir: PathBuf,
    base_dir: PathBuf,
    base_cache: HashMap<IssueIndex, TestCase>,
    base_cache_capacity: usize,
    /// Element streams of every accepted test case.
    issued: HashSet<Vec<u8>>,
    ready: ReadyQueue,
    /// Parent issue index to the indices of tests derived from it.
    tree: BTreeMap<IssueIndex, Vec<IssueIndex>>,
    next_index: IssueIndex,
    arrivals: u64,
    duplicates: u64,
}

impl TestPool {
    /// Create a pool persisting into `accepted_dir` and `base_dir`.
    pub fn new(
        accepted_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        strategy: SelectionStrategy,
        base_cache_capacity: usize,
    ) -> DomainResult<Self> {
        let accepted_dir = accepted_dir.into();
        let base_dir = base_dir.into();
        for dir in [&accepted_dir, &base_dir] {
            std::fs::create_dir_all(dir).map_err(|e| DomainError::resource(dir, e))?;
        }
        Ok(Self {
            accepted_dir,
            base_dir,
            base_cache: HashMap::new(),
            base_cache_capacity: base_cache_capacity.max(1),
            issued: HashSet::new(),
            ready: ReadyQueue::new(strategy)?,
            tree: BTreeMap::new(),
            next_index: 1,
            arrivals: 0,
            duplicates: 0,
        })
    }

    /// Cache a complete test case under its issue index so later patches can
    /// resolve against it. Clears the whole cache once it is full.
    #[instrument(skip(self, tc), fields(issue_index = ?tc.issue_index()))]
    pub fn insert_base(&mut self, tc: &TestCase) -> DomainResult<()> {
        if tc.is_patch() {
            return Err(DomainError::InvalidTestCase(
                "a patch cannot serve as a base".into(),
            ));
        }
        let index = tc.issue_index().ok_or_else(|| {
            DomainError::InvalidTestCase("base test case has no issue index".into())
        })?;

        let path = self.base_path(index);
        let json = serde_json::to_vec(tc)?;
        std::fs::write(&path, json).map_err(|e| DomainError::resource(&path, e))?;

        self.cache_base(index, tc.clone());
        Ok(())
    }

    fn cache_base(&mut self, index: IssueIndex, tc: TestCase) {
        if self.base_cache.len() >= self.base_cache_capacity && !self.base_cache.contains_key(&index)
        {
            debug!(capacity = self.base_cache_capacity, "base cache full, clearing");
            self.base_cache.clear();
        }
        self.base_cache.insert(index, tc);
    }

    /// Resolve a patch into a complete test case, reloading its base from
    /// persisted storage on a cache miss.
    pub fn resolve(&mut self, patch: &TestCase) -> DomainResult<TestCase> {
        let Some(info) = patch.patch_info() else {
            return Ok(patch.clone());
        };
        let index = info.base_issue_index;

        if !self.base_cache.contains_key(&index) {
            let path = self.base_path(index);
            let bytes = std::fs::read(&path).map_err(|_| DomainError::BaseNotFound(index))?;
            let base: TestCase = serde_json::from_slice(&bytes)?;
            self.cache_base(index, base);
        }

        let base = self
            .base_cache
            .get(&index)
            .ok_or(DomainError::BaseNotFound(index))?;
        patch.resolve_against(base)
    }

    /// Resolve, deduplicate, persist and queue one test case.
    pub fn insert(&mut self, tc: &TestCase) -> DomainResult<Admission> {
        self.insert_with_parent(tc, None)
    }

    /// Insert tests derived from `parent`, recording them in the test tree.
    pub fn insert_batch(
        &mut self,
        tests: &[TestCase],
        parent: Option<IssueIndex>,
    ) -> DomainResult<Vec<Admission>> {
        tests
            .iter()
            .map(|tc| self.insert_with_parent(tc, parent))
            .collect()
    }

    fn insert_with_parent(
        &mut self,
        tc: &TestCase,
        parent: Option<IssueIndex>,
    ) -> DomainResult<Admission> {
        let mut complete = self.resolve(tc)?;

        if !self.issued.insert(complete.encode_elements()) {
            self.duplicates += 1;
            debug!(duplicates = self.duplicates, "duplicate test case dropped");
            return Ok(Admission::Duplicate);
        }

        let index = self.next_index;
        self.next_index += 1;
        complete.set_issue_index(index);
        complete.write_elements(&self.accepted_dir.join(index.to_string()))?;

        self.tree.entry(index).or_default();
        if let Some(parent) = parent {
            self.tree.entry(parent).or_default().push(index);
        }

        self.arrivals += 1;
        self.ready.push(complete, self.arrivals, index);
        Ok(Admission::Accepted(index))
    }

    /// Next test case to dispatch.
    pub fn next(&mut self) -> Option<TestCase> {
        self.ready.pop()
    }

    /// Test cases accepted for this target.
    pub const fn count_all(&self) -> u64 {
        self.next_index - 1
    }

    /// Test cases waiting to be dispatched.
    pub fn count_next(&self) -> usize {
        self.ready.len()
    }

    pub const fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    pub fn base_cache_len(&self) -> usize {
        self.base_cache.len()
    }

    /// One line per accepted test: `Node tc-<index>: [<children> ]`.
    pub fn test_tree(&self) -> String {
        let mut out = String::new();
        for (index, children) in &self.tree {
            out.push_str(&format!("Node tc-{index}: ["));
            for child in children {
                out.push_str(&format!("tc-{child} "));
            }
            out.push_str("]\n");
        }
        out
    }

    /// Forget all test cases; persisted files are left in place.
    pub fn clear(&mut self) {
        info!(
            accepted = self.count_all(),
            duplicates = self.duplicates,
            "clearing test pool"
        );
        self.base_cache.clear();
        self.issued.clear();
        self.ready.clear();
        self.tree.clear();
        self.next_index = 1;
        self.arrivals = 0;
        self.duplicates = 0;
    }

    /// Re-point persistence at a new root (used when a target rotates).
    pub fn relocate(&mut self, accepted_dir: &Path, base_dir: &Path) -> DomainResult<()> {
        for dir in [accepted_dir, base_dir] {
            std::fs::create_dir_all(dir).map_err(|e| DomainError::resource(dir, e))?;
        }
        self.accepted_dir = accepted_dir.to_path_buf();
        self.base_dir = base_dir.to_path_buf();
        Ok(())
    }

    fn base_path(&self, index: IssueIndex) -> PathBuf {
        self.base_dir.join(format!("{index}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::test_case::{TestCaseElement, TraceTag, TraceTagNode};
    use proptest::prelude::*;

    fn tc(pairs: &[(&str, &str)]) -> TestCase {
        TestCase::new(
            pairs
                .iter()
                .map(|(n, d)| TestCaseElement::new(*n, d.as_bytes()))
                .collect(),
        )
    }

    fn pool(dir: &Path, strategy: SelectionStrategy, capacity: usize) -> TestPool {
        TestPool::new(dir.join("test-case"), dir.join("test-case-base"), strategy, capacity).unwrap()
    }

    #[test]
    fn test_accepts_and_persists_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);

        assert_eq!(pool.insert(&tc(&[("a", "1")])).unwrap(), Admission::Accepted(1));
        assert_eq!(pool.insert(&tc(&[("a", "2")])).unwrap(), Admission::Accepted(2));
        assert_eq!(pool.count_all(), 2);

        let stored = TestCase::read_elements(&dir.path().join("test-case/2")).unwrap();
        assert_eq!(stored.element("a").unwrap().data, b"2");

        let first = pool.next().unwrap();
        assert_eq!(first.issue_index(), Some(1));
        assert_eq!(pool.count_next(), 1);
    }

    #[test]
    fn test_patch_resolves_against_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);
        let base = tc(&[("x", "1"), ("y", "2")]).with_issue_index(7);
        pool.insert_base(&base).unwrap();

        let patch = TestCase::patch(7, vec![TestCaseElement::new("y", "3")]);
        pool.insert(&patch).unwrap();

        let resolved = pool.next().unwrap();
        assert_eq!(resolved.element("x").unwrap().data, b"1");
        assert_eq!(resolved.element("y").unwrap().data, b"3");
        assert_eq!(resolved.elements().len(), 2);
    }

    #[test]
    fn test_duplicate_patches_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);
        pool.insert_base(&tc(&[("x", "1"), ("y", "2")]).with_issue_index(1))
            .unwrap();

        let p1 = TestCase::patch(1, vec![TestCaseElement::new("y", "3")]);
        let p2 = TestCase::patch(1, vec![TestCaseElement::new("y", "3")]);
        pool.insert(&p1).unwrap();
        assert_eq!(pool.insert(&p2).unwrap(), Admission::Duplicate);

        assert_eq!(pool.duplicate_count(), 1);
        assert_eq!(pool.count_next(), 1);
    }

    #[test]
    fn test_distinct_contents_never_merged() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);
        let tests: Vec<TestCase> = (0..=255u8)
            .map(|b| TestCase::new(vec![TestCaseElement::new("stdin", vec![b, 0])]))
            .chain((0..=255u8).map(|b| TestCase::new(vec![TestCaseElement::new("stdin", vec![0, b])])))
            .collect();
        let admissions = pool.insert_batch(&tests, None).unwrap();

        // [0, 0] appears in both halves.
        assert_eq!(pool.count_all(), 511);
        assert_eq!(pool.duplicate_count(), 1);
        assert_eq!(admissions[256], Admission::Duplicate);

        let relabelled = tests[1].clone().with_issue_index(77);
        assert_eq!(pool.insert(&relabelled).unwrap(), Admission::Duplicate);
    }

    #[test]
    fn test_base_cache_full_clear_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 2);
        for i in 1..=2 {
            pool.insert_base(&tc(&[("x", &i.to_string())]).with_issue_index(i))
                .unwrap();
        }
        assert_eq!(pool.base_cache_len(), 2);
        pool.insert_base(&tc(&[("x", "3")]).with_issue_index(3)).unwrap();
        assert_eq!(pool.base_cache_len(), 1);

        let patch = TestCase::patch(1, vec![TestCaseElement::new("z", "9")]);
        let resolved = pool.resolve(&patch).unwrap();
        assert_eq!(resolved.element("x").unwrap().data, b"1");
        assert_eq!(pool.base_cache_len(), 2);
    }

    #[test]
    fn test_missing_base_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 2);
        let patch = TestCase::patch(42, vec![]);
        assert!(matches!(pool.insert(&patch), Err(DomainError::BaseNotFound(42))));
    }

    #[test]
    fn test_bfs_orders_by_last_node_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Bfs, 10);
        let tagged = |name: &str, depth: usize| {
            tc(&[("a", name)]).with_trace_tag(TraceTag {
                explored: vec![TraceTagNode::default(); depth],
                new_nodes: vec![],
            })
        };
        pool.insert(&tagged("deep", 5)).unwrap();
        pool.insert(&tagged("shallow", 1)).unwrap();
        pool.insert(&tagged("shallow2", 1)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| pool.next())
            .map(|t| String::from_utf8(t.element("a").unwrap().data.clone()).unwrap())
            .collect();
        assert_eq!(order, vec!["shallow", "shallow2", "deep"]);
    }

    #[test]
    fn test_graph_only_strategies_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TestPool::new(
            dir.path().join("a"),
            dir.path().join("b"),
            SelectionStrategy::WeightGroup,
            1
        )
        .is_err());
    }

    #[test]
    fn test_tree_records_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);
        pool.insert(&tc(&[("a", "root")])).unwrap();
        pool.insert_batch(&[tc(&[("a", "c1")]), tc(&[("a", "c2")])], Some(1))
            .unwrap();
        assert_eq!(
            pool.test_tree(),
            "Node tc-1: [tc-2 tc-3 ]\nNode tc-2: []\nNode tc-3: []\n"
        );
    }

    #[test]
    fn test_clear_restarts_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 10);
        pool.insert(&tc(&[("a", "1")])).unwrap();
        pool.clear();
        assert_eq!(pool.count_all(), 0);
        assert_eq!(pool.insert(&tc(&[("a", "1")])).unwrap(), Admission::Accepted(1));
    }

    proptest! {
        #[test]
        fn prop_ready_queue_never_holds_duplicates(values in proptest::collection::vec(0u8..6, 1..30)) {
            let dir = tempfile::tempdir().unwrap();
            let mut pool = pool(dir.path(), SelectionStrategy::Fifo, 4);
            for v in &values {
                pool.insert(&tc(&[("v", &v.to_string())])).unwrap();
            }
            let distinct: HashSet<_> = values.iter().collect();
            prop_assert_eq!(pool.count_next(), distinct.len());
            prop_assert_eq!(pool.duplicate_count() as usize, values.len() - distinct.len());
        }
    }
}
