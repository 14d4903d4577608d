//! MeshMonitor virtual node server
//!
//! A TCP endpoint speaking the radio's own wire protocol, letting many
//! native client apps share one physical device: per-client config replay,
//! default-deny admin filtering, serialized outbound traffic, and
//! broadcast fan-in of everything the radio says.

pub mod client;
pub mod error;
pub mod filter;
pub mod replay;
pub mod server;

pub use error::{Result, VnsError};
pub use filter::{evaluate, FilterVerdict, MirrorOp};
pub use server::{VirtualNodeServer, VnsConfig};
