//! Pairing Event System
//!
//! This module defines events emitted during the pairing process.

/// Events emitted by the pairing service
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// A pairing code was accepted and written to the registry
    PairingAccepted {
        /// ID of the paired device
        device_id: String,
        /// Name of the paired device
        device_name: String,
        /// Fingerprint of the device's public key
        key_fingerprint: String,
        /// Whether an existing record for this device was replaced
        replaced: bool,
    },

    /// A pairing code was rejected
    PairingRejected {
        /// ID of the device, when the payload got far enough to name one
        device_id: Option<String>,
        /// Why it was rejected, suitable for display
        reason: String,
    },

    /// Device was unpaired
    DeviceUnpaired {
        /// ID of the unpaired device
        device_id: String,
    },

    /// The signing keypair was regenerated and every pairing dropped
    KeysReset {
        /// Fingerprint of the new public key
        key_fingerprint: String,
        /// Number of pairings removed
        removed: usize,
    },
}

impl PairingEvent {
    /// Check if this is a pairing accepted event
    pub fn is_pairing_accepted(&self) -> bool {
        matches!(self, PairingEvent::PairingAccepted { .. })
    }

    /// Check if this is a pairing rejected event
    pub fn is_pairing_rejected(&self) -> bool {
        matches!(self, PairingEvent::PairingRejected { .. })
    }

    /// Get device ID if this event is device-related
    pub fn device_id(&self) -> Option<&str> {
        match self {
            PairingEvent::PairingAccepted { device_id, .. } => Some(device_id),
            PairingEvent::PairingRejected { device_id, .. } => device_id.as_deref(),
            PairingEvent::DeviceUnpaired { device_id } => Some(device_id),
            PairingEvent::KeysReset { .. } => None,
        }
    }
}
