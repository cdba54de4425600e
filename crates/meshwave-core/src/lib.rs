//! Core transport and state machinery for MeshWave: a LAN peer-to-peer chat
//! and file-transfer service. This crate has no `main`, no CLI, and no
//! dashboard — it is the wire codec, discovery, transfer engine, and
//! hub/peer endpoints that a presentation layer (see `meshwave-cli`) drives.

pub mod discovery;
pub mod error;
pub mod events;
pub mod hub;
pub mod logging;
pub mod peer;
pub mod transfer;
pub mod wire;

pub use discovery::{Announcer, Scanner, SeenServers, ServerInfo};
pub use events::{ChatEvent, EventQueue};
pub use hub::Hub;
pub use logging::{NullLogger, TracingLogger, TransferLogger};
pub use peer::Peer;
pub use transfer::{TransferInfo, TransferTable, XferState};
