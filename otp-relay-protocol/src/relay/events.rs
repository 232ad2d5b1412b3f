//! Relay Server Events
//!
//! Events emitted by the relay server for connection and payload activity.

use std::net::SocketAddr;

/// Relay server event types
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server is accepting connections
    Started {
        /// Address actually bound
        local_addr: SocketAddr,
    },

    /// A peer was turned away
    PeerRejected {
        /// Remote address
        remote_addr: SocketAddr,
        /// Why it was rejected
        reason: String,
    },

    /// A new application message was handed to the handler
    MessageReceived {
        /// Remote address
        remote_addr: SocketAddr,
        /// Message ID
        message_id: String,
    },

    /// A pairing envelope was verified and handed to the handler
    PairingReceived {
        /// Remote address
        remote_addr: SocketAddr,
        /// Device ID inside the envelope
        device_id: String,
    },

    /// Server stopped accepting and drained its connections
    Stopped,
}
