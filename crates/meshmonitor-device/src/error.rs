//! Error types for the device engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Session is closed")]
    Closed,

    #[error("Not connected to the radio")]
    NotConnected,

    #[error("Codec error: {0}")]
    Proto(#[from] meshmonitor_proto::ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] meshmonitor_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
