//! Capability interface between the command session and an index.
//!
//! The session only marshals bytes into these calls. Any locking the index
//! needs for concurrent search/train is the implementation's business.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::ProtocolError;
use crate::schema::SchemaStream;
use crate::types::{DataType, DistanceType};
use crate::vector_stream::VectorStream;

/// Shape of an index, as reported by `info` and required by `create`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id_size: u32,
    pub num_dims: u32,
    pub data_type: DataType,
    pub distance_type: DistanceType,
    pub schema: SchemaStream,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("index not found: {0}")]
    NotFound(PathBuf),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("dimension mismatch: {field} expected {expected}, got {actual}")]
    DimensionMismatch {
        field: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("index is not trained")]
    NotTrained,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] bincode::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::SchemaMismatch(_) => ErrorCode::SchemaMismatch,
            EngineError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            EngineError::NotTrained => ErrorCode::NotTrained,
            EngineError::Io(_) | EngineError::Storage(_) => ErrorCode::IoError,
        }
    }
}

/// Error code carried by an error response.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound = 1,
    SchemaMismatch = 2,
    DimensionMismatch = 3,
    NotTrained = 4,
    IoError = 5,
}

impl TryFrom<u32> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::NotFound),
            2 => Ok(ErrorCode::SchemaMismatch),
            3 => Ok(ErrorCode::DimensionMismatch),
            4 => Ok(ErrorCode::NotTrained),
            5 => Ok(ErrorCode::IoError),
            other => Err(ProtocolError::UnknownDiscriminant {
                field: "errorCode",
                value: other,
            }),
        }
    }
}

pub trait IndexEngine: Send + Sync {
    fn info(&self) -> IndexInfo;

    fn train(&self, vectors: VectorStream) -> Result<(), EngineError>;

    /// Returns one stream per query. Each holds the neighbours' ids with a
    /// single dimension: the distance to the query.
    fn search(&self, queries: &VectorStream, k: u32) -> Result<Vec<VectorStream>, EngineError>;

    fn save(&self) -> Result<(), EngineError>;

    /// Called once when the owning session ends, on every exit path.
    fn close(&self) {}
}
