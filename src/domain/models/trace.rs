//! Execution traces and their on-disk representation.
//!
//! A trace directory is named by a generated unique id and holds the block
//! sequence (`tb-seq.bin`, little-endian `u64` addresses) next to the test
//! case that produced it (`concrete_inputs.bin`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Address of one executed unit of code.
pub type Block = u64;

/// Identifier of a trace, derived from its storage location.
pub type TraceId = String;

/// File holding the executed block sequence of a trace.
pub const BLOCK_SEQUENCE_FILE: &str = "tb-seq.bin";

/// File holding the concrete input that produced a trace.
pub const CONCRETE_INPUT_FILE: &str = "concrete_inputs.bin";

/// Full test case record (issue index and trace-tag) next to the input.
pub const CONCRETE_INPUT_RECORD_FILE: &str = "concrete_inputs.json";

const BLOCK_WIDTH: usize = std::mem::size_of::<Block>();

/// An identified, non-empty, immutable sequence of blocks.
///
/// Two traces are equal when their identifiers match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    id: TraceId,
    blocks: Vec<Block>,
}

impl PartialEq for Trace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trace {}

impl Trace {
    /// Create a trace, rejecting empty block sequences.
    pub fn new(id: impl Into<TraceId>, blocks: Vec<Block>) -> DomainResult<Self> {
        let id = id.into();
        if blocks.is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "trace {id} has no blocks"
            )));
        }
        Ok(Self { id, blocks })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Replace the block sequence, keeping the identifier.
    pub fn with_blocks(self, blocks: Vec<Block>) -> DomainResult<Self> {
        Self::new(self.id, blocks)
    }

    /// Load a trace from its directory; the directory name is the identifier.
    pub fn load(dir: &Path) -> DomainResult<Self> {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DomainError::resource(dir, "trace directory has no name"))?
            .to_string();
        let path = dir.join(BLOCK_SEQUENCE_FILE);
        let bytes = std::fs::read(&path).map_err(|e| DomainError::resource(&path, e))?;
        let blocks = decode_blocks(&bytes).map_err(|e| DomainError::resource(&path, e))?;
        Self::new(id, blocks)
    }
}

/// Decode a little-endian block sequence.
pub fn decode_blocks(bytes: &[u8]) -> DomainResult<Vec<Block>> {
    if bytes.len() % BLOCK_WIDTH != 0 {
        return Err(DomainError::Serialization(format!(
            "block sequence length {} is not a multiple of {BLOCK_WIDTH}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BLOCK_WIDTH)
        .map(|chunk| {
            let mut raw = [0u8; BLOCK_WIDTH];
            raw.copy_from_slice(chunk);
            Block::from_le_bytes(raw)
        })
        .collect())
}

/// Encode a block sequence as little-endian bytes.
pub fn encode_blocks(blocks: &[Block]) -> Vec<u8> {
    blocks.iter().flat_map(|b| b.to_le_bytes()).collect()
}

/// A trace directory stored by a concrete worker or by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceArtifact {
    pub id: TraceId,
    pub dir: PathBuf,
}

impl TraceArtifact {
    /// Allocate a fresh uniquely named trace directory path under `parent`.
    pub fn allocate(parent: &Path) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            dir: parent.join(&id),
            id,
        }
    }

    pub fn block_sequence_path(&self) -> PathBuf {
        self.dir.join(BLOCK_SEQUENCE_FILE)
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(CONCRETE_INPUT_FILE)
    }

    pub fn input_record_path(&self) -> PathBuf {
        self.dir.join(CONCRETE_INPUT_RECORD_FILE)
    }

    pub fn load_trace(&self) -> DomainResult<Trace> {
        Trace::load(&self.dir)
    }
}

/// The flattened content of a trace directory, used to move traces between
/// machines.
///
/// Encoding: `u32` file count, then per file `u32` name length, name bytes,
/// `u64` data length and data bytes (all little-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBundle {
    pub id: TraceId,
    pub files: Vec<(String, Vec<u8>)>,
}

impl TraceBundle {
    /// Read every regular file at the top level of a trace directory.
    pub fn from_artifact(artifact: &TraceArtifact) -> DomainResult<Self> {
        let mut files = Vec::new();
        let entries =
            std::fs::read_dir(&artifact.dir).map_err(|e| DomainError::resource(&artifact.dir, e))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push((name, std::fs::read(entry.path())?));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            id: artifact.id.clone(),
            files,
        })
    }

    /// Write the bundle out as `<parent>/<id>/...`.
    pub fn unpack(&self, parent: &Path) -> DomainResult<TraceArtifact> {
        let dir = parent.join(&self.id);
        std::fs::create_dir_all(&dir).map_err(|e| DomainError::resource(&dir, e))?;
        for (name, data) in &self.files {
            if name.contains('/') || name.contains("..") {
                return Err(DomainError::Protocol(format!(
                    "trace bundle file name {name:?} escapes its directory"
                )));
            }
            std::fs::write(dir.join(name), data)?;
        }
        Ok(TraceArtifact {
            id: self.id.clone(),
            dir,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.id);
        out.extend_from_slice(&(self.files.len() as u32).to_le_bytes());
        for (name, data) in &self.files {
            put_str(&mut out, name);
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> DomainResult<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let id = cursor.string()?;
        let count = cursor.u32()? as usize;
        let mut files = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = cursor.string()?;
            let len = usize::try_from(cursor.u64()?)
                .map_err(|_| DomainError::Serialization("file length overflow".into()))?;
            files.push((name, cursor.take(len)?.to_vec()));
        }
        Ok(Self { id, files })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Little-endian reader over a byte slice with bounds checking.
pub(crate) struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> DomainResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                DomainError::Serialization(format!(
                    "truncated input: wanted {len} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u32(&mut self) -> DomainResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub(crate) fn u64(&mut self) -> DomainResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn string(&mut self) -> DomainResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DomainError::Serialization(format!("invalid utf-8: {e}")))
    }

    pub(crate) const fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
