//! `vita-ske`: the Key Management Core of the Vita IPsec/ESP VPN gateway.
//!
//! This crate implements the vita-ske1 authenticated key-exchange protocol,
//! the per-route Security Association lifecycle (rekeying, cutover,
//! reconfiguration), and publication of the active SA set for external
//! ESP/decrypt worker processes to consume. Packet encryption/decryption,
//! IP forwarding, and NIC plumbing are handled by other processes entirely.

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod route;
pub mod sa;

pub mod cli;

pub use config::{ConfigDelta, ManagerConfig, RouteConfig};
pub use error::{ConfigError, FrameError, FsmError, ManagerError};
pub use manager::{KeyManager, OutboundDatagram, TickOutput};
pub use metrics::{Counters, CountersSnapshot};
pub use route::{Route, RouteId, RouteStatus};
pub use sa::{SaDatabase, SaRecord};
