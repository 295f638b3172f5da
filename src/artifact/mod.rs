//! Compiled model artifacts.
//!
//! The compilation pipeline emits one artifact per (model, batch size):
//! weights paged into fixed-size GPU blocks plus per-op kernel references.
//! The controller only consumes the metadata here — page counts feed the
//! memory accounting, everything else is passed through to workers.
//!
//! Encoding is a stable binary format; decoding is a pure round-trip for
//! all fields.

use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode artifact: {0}")]
    Decode(String),

    #[error("failed to encode artifact: {0}")]
    Encode(String),

    #[error("artifact digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("artifact has zero pages")]
    ZeroPages,

    #[error("artifact page size is zero")]
    ZeroPageSize,

    #[error("op {op} references page {page} beyond total {total}")]
    PageOutOfRange { op: usize, page: u32, total: u32 },

    #[error("tensor has empty shape")]
    EmptyShape,
}

/// A tensor location within a flat buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDef {
    pub offset: u64,
    pub size: u64,
    pub shape: Vec<i64>,
}

/// Scratch allocation within a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceAllocDef {
    pub offset: u64,
    pub size: u64,
}

/// One operator: kernel references plus input/workspace placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDef {
    pub inputs: Vec<TensorDef>,
    pub so_function: u32,
    pub cuda_functions: Vec<u32>,
    pub workspace_allocs: Vec<WorkspaceAllocDef>,
}

/// Flat-memory model definition, the compiler's intermediate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub total_memory: u64,
    pub weights_memory: u64,
    pub workspace_memory: u64,
    pub so_functions: Vec<String>,
    pub cuda_functions: Vec<String>,
    pub ops: Vec<OpDef>,
    pub inputs: Vec<TensorDef>,
    pub outputs: Vec<TensorDef>,
}

/// A tensor mapped onto a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMappedTensorDef {
    pub base_offset: u64,
    pub page: u32,
    pub page_offset: u64,
    pub size: u64,
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMappedWorkspaceAllocDef {
    pub page: u32,
    pub page_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMappedOpDef {
    pub inputs: Vec<PageMappedTensorDef>,
    pub so_function: u32,
    pub cuda_functions: Vec<u32>,
    pub workspace_allocs: Vec<PageMappedWorkspaceAllocDef>,
}

/// One weights page within the artifact blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDef {
    pub base_offset: u64,
    pub size: u64,
}

/// Page-mapped model definition: what workers execute and what the
/// controller accounts pages against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMappedModelDef {
    pub paged_required_memory: u64,
    pub minimum_required_memory: u64,
    pub weights_memory: u64,
    pub so_functions: Vec<String>,
    pub cuda_functions: Vec<String>,
    pub ops: Vec<PageMappedOpDef>,
    pub inputs: Vec<PageMappedTensorDef>,
    pub outputs: Vec<PageMappedTensorDef>,
    pub total_pages: u32,
    pub configured_page_size: u64,
    pub weights_pages: Vec<PageDef>,
}

impl ModelDef {
    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        bincode::serialize(self).map_err(|e| ArtifactError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        bincode::deserialize(bytes).map_err(|e| ArtifactError::Decode(e.to_string()))
    }
}

impl PageMappedModelDef {
    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        bincode::serialize(self).map_err(|e| ArtifactError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let def: Self =
            bincode::deserialize(bytes).map_err(|e| ArtifactError::Decode(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    /// Structural checks the controller relies on.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.total_pages == 0 {
            return Err(ArtifactError::ZeroPages);
        }
        if self.configured_page_size == 0 {
            return Err(ArtifactError::ZeroPageSize);
        }
        for (i, op) in self.ops.iter().enumerate() {
            for tensor in &op.inputs {
                if tensor.shape.is_empty() {
                    return Err(ArtifactError::EmptyShape);
                }
                if tensor.page >= self.total_pages {
                    return Err(ArtifactError::PageOutOfRange {
                        op: i,
                        page: tensor.page,
                        total: self.total_pages,
                    });
                }
            }
            for alloc in &op.workspace_allocs {
                if alloc.page >= self.total_pages {
                    return Err(ArtifactError::PageOutOfRange {
                        op: i,
                        page: alloc.page,
                        total: self.total_pages,
                    });
                }
            }
        }
        Ok(())
    }

    /// Load an artifact file through a read-only mapping.
    pub fn load_file(path: &Path) -> Result<Self, ArtifactError> {
        let file = std::fs::File::open(path)?;
        // Read-only mapping of an immutable artifact file.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::decode(&mmap)
    }

    /// Load and verify against a SHA-256 digest recorded at compile time.
    pub fn load_verified(path: &Path, expected_hex: &str) -> Result<Self, ArtifactError> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let computed = hex::encode(Sha256::digest(&mmap[..]));
        if !computed.eq_ignore_ascii_case(expected_hex) {
            return Err(ArtifactError::DigestMismatch {
                expected: expected_hex.to_string(),
                computed,
            });
        }
        Self::decode(&mmap)
    }
}
