use thiserror::Error;

use crate::model::MemoryRegion;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Region {region} exhausted: requested {requested} bytes, {available} available")]
    CapacityExceeded {
        region: MemoryRegion,
        requested: usize,
        available: usize,
    },

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
