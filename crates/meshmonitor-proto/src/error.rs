//! Error types for codec operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Frame payload too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
