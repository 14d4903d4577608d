//! MeshMonitor wire codec
//!
//! Everything needed to speak the radio's protocol: the 4-byte stream
//! framing, a hand-maintained mirror of the Meshtastic protobuf schema
//! subset, port-number normalization, and the concatenated-blob splitter
//! used by the HTTP transport variant.

pub mod admin;
pub mod channel;
pub mod concat;
pub mod config;
pub mod error;
pub mod framing;
pub mod mesh;
pub mod portnum;
pub mod telemetry;
pub mod types;

pub use error::{ProtoError, Result};

/// Decode any mirrored payload type, all-or-nothing.
pub fn decode_payload<T: prost::Message + Default>(bytes: &[u8]) -> Result<T> {
    T::decode(bytes).map_err(ProtoError::from)
}
pub use framing::{encode_frame, FrameDecoder, MAX_PAYLOAD_LEN};
pub use mesh::{decode_from_radio, decode_to_radio, FromRadio, MeshPacket, ToRadio};
pub use portnum::PortNum;
pub use types::{node_id_from_num, node_num_from_id, BROADCAST_NUM};

// Re-exported so downstream crates encode without naming prost directly.
pub use prost::Message;
