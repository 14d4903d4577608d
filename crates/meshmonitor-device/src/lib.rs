//! MeshMonitor device engine
//!
//! Owns the physical-radio session (connect/configure/operate/reconnect),
//! routes decoded packets into the store, and correlates outbound requests
//! with their acks and replies. The virtual node server and the
//! automations plug in through the [`Fanout`] and [`AutomationHooks`]
//! seams.

pub mod error;
pub mod events;
pub mod router;
pub mod session;
pub mod tracker;

pub use error::{DeviceError, Result};
pub use events::{CachedConfigRecord, ConfigRecordKind, SessionEvent, SessionState};
pub use router::{AutomationHooks, Fanout, PacketOrigin, PacketRouter, RouterStats};
pub use session::{DeviceSession, SessionConfig, WANT_CONFIG_ALL};
pub use tracker::{PendingRequest, RequestKind, RequestTracker};
