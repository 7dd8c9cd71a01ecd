//! Connection hub for Vigil.
//!
//! The hub is the single owner of the live-connection registry. It runs as
//! one Tokio task (actor model): every register, unregister, broadcast,
//! and targeted disconnect is a command on its channel, so the registry is
//! only ever touched by one task and never while doing socket I/O.
//!
//! # Key types
//!
//! - [`HubHandle`]: cheap, cloneable handle used by everyone else
//! - [`Registration`]: what a connection handler gets back from `register`:
//!   its outbound queue and an eviction signal
//! - [`CloseReason`]: why the hub (or the handler) ended a connection
//! - [`ConnectionState`]: per-connection lifecycle state machine
//! - [`HubConfig`]: queue bound, command channel size, presence toggle

mod config;
mod error;
mod hub;

pub use config::{CloseReason, ConnectionState, HubConfig};
pub use error::HubError;
pub use hub::{BroadcastReport, Frame, HubHandle, Member, Registration};
