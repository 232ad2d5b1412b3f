//! Authenticated Relay
//!
//! WebSocket transport between the two devices. A peer proves it holds the
//! shared secret with a fresh [`HandshakeHeader`] on the upgrade request,
//! then exchanges encrypted text frames answered with `confirmed`.
//!
//! ## Roles
//!
//! - **Client** ([`RelaySession`], [`RelayClient`]): connect, optionally wait
//!   for the server's verification challenge, send, await acknowledgement
//!   with one bounded resend
//! - **Server** ([`RelayServer`]): authenticate, optionally challenge,
//!   decode, hand to a [`RelayHandler`], acknowledge

pub mod client;
pub mod events;
pub mod frame;
pub mod header;
pub mod server;
pub mod session;

/// Default relay TCP port
pub const DEFAULT_RELAY_PORT: u16 = 9224;

pub use client::RelayClient;
pub use events::ServerEvent;
pub use frame::{
    decode_frame, InboundFrame, RelayMessage, RelayPayload, CONFIRMED_MARKER, REJECTED_MARKER,
};
pub use header::{HandshakeHeader, AUTH_HEADER, DEFAULT_FRESHNESS_WINDOW};
pub use server::{RelayHandler, RelayServer, ServerConfig};
pub use session::{ChallengePolicy, RelaySession, SessionConfig, SessionReport, SessionState};
