//! Error types for the virtual node server

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VnsError>;

#[derive(Error, Debug)]
pub enum VnsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Proto(#[from] meshmonitor_proto::ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] meshmonitor_store::StoreError),

    #[error("Device error: {0}")]
    Device(#[from] meshmonitor_device::DeviceError),

    #[error("Client {0} is gone")]
    ClientGone(String),
}
