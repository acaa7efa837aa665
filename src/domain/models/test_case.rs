//! Test cases: named input elements, optional patch encoding and trace-tag
//! scheduling metadata.
//!
//! The element stream written for a guest is little-endian:
//! `u32 count`, then per element `u32 name size`, name, `u32 data size`, data.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::trace::ByteCursor;

/// Upper bound on elements accepted when decoding a test case.
pub const MAX_ELEMENTS: u32 = 4096;

/// Upper bound on a single element's data size.
pub const MAX_ELEMENT_SIZE: u32 = 64 * 1024 * 1024;

/// Sequential number given to every accepted test case.
pub type IssueIndex = u64;

/// One named input buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestCaseElement {
    pub name: String,
    pub data: Vec<u8>,
}

impl TestCaseElement {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A branch node visited while producing a test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTagNode {
    pub pc: u64,
    pub count: u64,
    pub branches_taken: Vec<bool>,
}

/// Scheduling metadata carried by a test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTag {
    #[serde(default)]
    pub explored: Vec<TraceTagNode>,
    #[serde(default)]
    pub new_nodes: Vec<TraceTagNode>,
}

impl TraceTag {
    pub fn is_empty(&self) -> bool {
        self.explored.is_empty() && self.new_nodes.is_empty()
    }

    /// Index of the last node the producing path visited.
    pub fn last_node_index(&self) -> usize {
        self.explored.len()
    }
}

/// Marks a test case as a delta against a cached base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub base_issue_index: IssueIndex,
}

/// A concrete input for one execution of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    elements: Vec<TestCaseElement>,
    #[serde(default)]
    patch: Option<Patch>,
    #[serde(default)]
    issue_index: Option<IssueIndex>,
    #[serde(default)]
    trace_tag: TraceTag,
}

impl TestCase {
    /// Create a complete test case.
    pub fn new(elements: Vec<TestCaseElement>) -> Self {
        Self {
            elements,
            ..Self::default()
        }
    }

    /// Create a patch carrying only the elements that differ from a base.
    pub fn patch(base_issue_index: IssueIndex, elements: Vec<TestCaseElement>) -> Self {
        Self {
            elements,
            patch: Some(Patch { base_issue_index }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_trace_tag(mut self, tag: TraceTag) -> Self {
        self.trace_tag = tag;
        self
    }

    #[must_use]
    pub const fn with_issue_index(mut self, index: IssueIndex) -> Self {
        self.issue_index = Some(index);
        self
    }

    pub fn elements(&self) -> &[TestCaseElement] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&TestCaseElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub const fn patch_info(&self) -> Option<Patch> {
        self.patch
    }

    pub const fn is_patch(&self) -> bool {
        self.patch.is_some()
    }

    pub const fn issue_index(&self) -> Option<IssueIndex> {
        self.issue_index
    }

    pub(crate) fn set_issue_index(&mut self, index: IssueIndex) {
        self.issue_index = Some(index);
    }

    pub const fn trace_tag(&self) -> &TraceTag {
        &self.trace_tag
    }

    /// Overlay this patch on `base`, producing a complete test case.
    ///
    /// Elements are matched by name; patch elements absent from the base are
    /// appended in patch order. The result keeps the patch's trace-tag when it
    /// has one and the base's otherwise.
    pub fn resolve_against(&self, base: &Self) -> DomainResult<Self> {
        let Some(patch) = self.patch else {
            return Err(DomainError::InvalidTestCase(
                "cannot resolve a complete test case against a base".into(),
            ));
        };
        if base.is_patch() {
            return Err(DomainError::InvalidTestCase(format!(
                "base {} is itself a patch",
                patch.base_issue_index
            )));
        }

        let mut elements = base.elements.clone();
        for elem in &self.elements {
            match elements.iter_mut().find(|e| e.name == elem.name) {
                Some(slot) => slot.data.clone_from(&elem.data),
                None => elements.push(elem.clone()),
            }
        }

        let trace_tag = if self.trace_tag.is_empty() {
            base.trace_tag.clone()
        } else {
            self.trace_tag.clone()
        };

        Ok(Self {
            elements,
            patch: None,
            issue_index: None,
            trace_tag,
        })
    }

    /// Express this complete test case relative to `base`.
    ///
    /// Yields a patch holding the elements that differ from or are missing in
    /// the base. Falls back to a copy of `self` when the base has no issue
    /// index or when an element of the base is absent here.
    pub fn diff_against(&self, base: &Self) -> Self {
        let Some(index) = base.issue_index else {
            return Self::new(self.elements.clone()).with_trace_tag(self.trace_tag.clone());
        };
        if base.elements.iter().any(|b| self.element(&b.name).is_none()) {
            return Self::new(self.elements.clone()).with_trace_tag(self.trace_tag.clone());
        }
        let changed = self
            .elements
            .iter()
            .filter(|e| base.element(&e.name).is_none_or(|b| b.data != e.data))
            .cloned()
            .collect();
        Self::patch(index, changed).with_trace_tag(self.trace_tag.clone())
    }

    /// Serialize the element sequence in the guest input format.
    pub fn encode_elements(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.elements.len() as u32).to_le_bytes());
        for elem in &self.elements {
            out.extend_from_slice(&(elem.name.len() as u32).to_le_bytes());
            out.extend_from_slice(elem.name.as_bytes());
            out.extend_from_slice(&(elem.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&elem.data);
        }
        out
    }

    /// Parse the guest input format into a complete test case.
    pub fn decode_elements(bytes: &[u8]) -> DomainResult<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let count = cursor.u32()?;
        if count > MAX_ELEMENTS {
            return Err(DomainError::InvalidTestCase(format!(
                "element count {count} exceeds {MAX_ELEMENTS}"
            )));
        }
        let mut elements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = cursor.string()?;
            let size = cursor.u32()?;
            if size > MAX_ELEMENT_SIZE {
                return Err(DomainError::InvalidTestCase(format!(
                    "element {name} size {size} exceeds {MAX_ELEMENT_SIZE}"
                )));
            }
            let data = cursor.take(size as usize)?.to_vec();
            elements.push(TestCaseElement { name, data });
        }
        if !cursor.is_exhausted() {
            return Err(DomainError::InvalidTestCase(
                "trailing bytes after last element".into(),
            ));
        }
        Ok(Self::new(elements))
    }

    /// Write the element sequence to `path`.
    pub fn write_elements(&self, path: &Path) -> DomainResult<()> {
        std::fs::write(path, self.encode_elements()).map_err(|e| DomainError::resource(path, e))
    }

    /// Read a test case previously written with [`TestCase::write_elements`].
    pub fn read_elements(path: &Path) -> DomainResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| DomainError::resource(path, e))?;
        Self::decode_elements(&bytes).map_err(|e| DomainError::resource(path, e))
    }
}

/// Load every test case in `dir`, as used for seeds. Numbered files come
/// first in numeric order, the rest follow by name.
pub fn load_test_dir(dir: &Path) -> DomainResult<Vec<TestCase>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| DomainError::resource(dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort_by_cached_key(|p| {
        let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let number = name.parse::<u64>().ok();
        (number.is_none(), number, name)
    });
    paths.iter().map(|p| TestCase::read_elements(p)).collect()
}
