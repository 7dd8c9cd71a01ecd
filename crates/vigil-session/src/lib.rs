//! Session Authority for Vigil.
//!
//! This crate decides who may talk to the realtime hub and for how long:
//!
//! 1. **Issuing**: a successful login produces a signed, time-bound token
//!    and a persisted [`Session`] row ([`SessionAuthority::issue_session`])
//! 2. **Validating**: every token is checked twice, first its signature and
//!    expiry, *then* the existence of its session row
//!    ([`SessionAuthority::validate_token`])
//! 3. **Revoking**: deleting a row (or all of a user's rows) and telling
//!    the hub to close whatever connections depended on it
//!    ([`RevocationListener`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Server / REST middleware (above)  ← calls validate_token on every request
//!     ↕
//! Hub (beside)  ← implements RevocationListener, closes live connections
//!     ↕
//! Session Authority (this crate)  ← owns session rows exclusively
//!     ↕
//! Protocol Layer (below)  ← provides UserId, SessionId
//! ```

mod audit;
mod authority;
mod clock;
mod error;
mod revocation;
mod session;
mod store;
mod token;

pub use audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
pub use authority::SessionAuthority;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AuthError;
pub use revocation::{NoopListener, Revocation, RevocationListener, RevocationReason};
pub use session::{
    ClientInfo, IssuedSession, MAX_TOKEN_TTL, Principal, Session, SessionConfig, UserIdentity,
};
pub use store::{MemorySessionStore, SessionStore};
pub use token::{Claims, TokenSigner, hash_token};
