//! Multi-chunk file assembly
//!
//! One assembler per `(run, path)`. Chunks may arrive with redundant
//! completeness (a whole file in one chunk) but never with gaps,
//! duplicates, or disagreeing counts; any contradiction fails the path.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::parse::FileChunkContract;

/// A malformed chunk sequence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("chunk for path '{got}' fed to assembler for '{expected}'")]
    PathMismatch { expected: String, got: String },
    #[error("chunk_count changed mid-sequence: expected {expected}, got {got}")]
    CountMismatch { expected: u32, got: u32 },
    #[error("duplicate chunk index {index}")]
    DuplicateChunk { index: u32 },
    #[error("has_more is set but next_chunk_index is missing")]
    MissingNextIndex,
    #[error("next_chunk_index {got} contradicts chunk_index {index}")]
    ContradictoryNextIndex { index: u32, got: u32 },
}

/// What the caller should do after feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyProgress {
    /// All chunks are in; the concatenated content is the file.
    Complete(Vec<u8>),
    /// Request the chunk with this index next.
    NeedsChunk(u32),
}

/// Ordered chunk buffer for one output path.
#[derive(Debug)]
pub struct ChunkAssembler {
    path: String,
    chunk_count: Option<u32>,
    chunks: BTreeMap<u32, String>,
}

impl ChunkAssembler {
    /// Create an assembler for one relative path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            chunk_count: None,
            chunks: BTreeMap::new(),
        }
    }

    /// The path this assembler is collecting.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Feed one parsed chunk.
    ///
    /// # Errors
    ///
    /// Returns an [`AssemblyError`] on path mismatch, count disagreement,
    /// duplicate index, or contradictory continuation metadata. The parser
    /// has already guaranteed `chunk_index < chunk_count` and the
    /// `has_more` arithmetic.
    pub fn push(&mut self, chunk: &FileChunkContract) -> Result<AssemblyProgress, AssemblyError> {
        if chunk.path != self.path {
            return Err(AssemblyError::PathMismatch {
                expected: self.path.clone(),
                got: chunk.path.clone(),
            });
        }

        let meta = chunk.chunking;
        match self.chunk_count {
            None => self.chunk_count = Some(meta.chunk_count),
            Some(expected) if expected != meta.chunk_count => {
                return Err(AssemblyError::CountMismatch {
                    expected,
                    got: meta.chunk_count,
                });
            }
            Some(_) => {}
        }

        if self.chunks.contains_key(&meta.chunk_index) {
            return Err(AssemblyError::DuplicateChunk {
                index: meta.chunk_index,
            });
        }

        if meta.has_more {
            match meta.next_chunk_index {
                None => return Err(AssemblyError::MissingNextIndex),
                Some(next) if next != meta.chunk_index + 1 => {
                    return Err(AssemblyError::ContradictoryNextIndex {
                        index: meta.chunk_index,
                        got: next,
                    });
                }
                Some(_) => {}
            }
        }

        self.chunks.insert(meta.chunk_index, chunk.content.clone());

        let count = self.chunk_count.unwrap_or(1);
        if self.chunks.len() as u32 == count {
            // BTreeMap iterates in index order; indices are dense because
            // every index is below count and duplicates are rejected.
            let mut bytes = Vec::new();
            for content in self.chunks.values() {
                bytes.extend_from_slice(content.as_bytes());
            }
            Ok(AssemblyProgress::Complete(bytes))
        } else {
            let next = (0..count)
                .find(|index| !self.chunks.contains_key(index))
                .unwrap_or(count);
            Ok(AssemblyProgress::NeedsChunk(next))
        }
    }
}
