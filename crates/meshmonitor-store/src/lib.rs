//! MeshMonitor durable mesh model
//!
//! SQLite-backed store of everything the monitor knows about the mesh:
//! nodes, channels, the message log, traceroutes, telemetry, settings, and
//! the audit trail. All mutation goes through [`Store`] operations.

pub mod error;
pub mod model;
pub mod store;

pub use error::{Result, StoreError};
pub use model::{
    AuditEntry, Channel, DeliveryState, Message, MessagePage, NeighborEdge, Node, NodePatch,
    RawPacket, TelemetryKind, TelemetrySample, TracerouteRecord,
};
pub use store::Store;
