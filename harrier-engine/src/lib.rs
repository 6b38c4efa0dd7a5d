//! Harrier: transparent TLS-intercepting VPN traffic engine.
//!
//! The engine captures raw IP packets from a TUN-style device interface,
//! reconstructs TCP/UDP transport sessions, detects and (optionally)
//! terminates TLS with certificates forged on the fly, reassembles
//! application-layer messages for persistence, and re-emits traffic to both
//! the original remote host and the intercepted local client.
//!
//! ```text
//! +------------------------------------------------------------+
//! |                  Application layer                         |
//! |  (HTTP reassembly, DNS reply caching, raw passthrough)     |
//! +------------------------------------------------------------+
//!                              |
//! +------------------------------------------------------------+
//! |                  Encryption layer                          |
//! |  (protocol sniffing, TLS record reassembly, dual-session   |
//! |   MitM state machine, QUIC/plaintext passthrough)          |
//! +------------------------------------------------------------+
//!                              |
//! +------------------------------------------------------------+
//! |                  Transport layer                           |
//! |  (pseudo-TCP state machine, sequence bookkeeping, UDP      |
//! |   sessions, outward sockets on a shared multiplexer)       |
//! +------------------------------------------------------------+
//!                              |
//! +------------------------------------------------------------+
//! |                  Device interface                          |
//! |  (raw IP packets in, synthesized IP packets out)           |
//! +------------------------------------------------------------+
//! ```
//!
//! Scheduling is a small fixed set of threads: one blocks on the shared
//! socket multiplexer, one drains the device-write queue, and the embedder's
//! device-read path feeds packets in via
//! [`ComponentManager::process_outbound_packet`].

pub mod app;
pub mod cache;
pub mod components;
pub mod config;
pub mod encryption;
pub mod error;
pub mod logging;
pub mod packet;
pub mod socket_protect;
pub mod stats;
pub mod transport;

#[cfg(test)]
pub(crate) mod tests;

pub use components::app_finder::{AppFinder, NullAppFinder};
pub use components::database::{
    ConnectionRecord, DatabaseConnector, HttpRequestRecord, HttpResponseRecord,
    NullDatabaseConnector,
};
pub use components::manager::ComponentManager;
pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{EngineError, Result};
pub use harrier_mitm::Authority;
pub use stats::StatsSnapshot;
