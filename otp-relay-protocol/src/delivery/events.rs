//! Delivery Events
//!
//! Events emitted by the delivery queue as attempts progress.

use crate::discovery::Endpoint;
use std::time::Duration;

/// Delivery event types
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// A payload was queued
    Queued {
        /// Attempt ID
        attempt_id: String,
    },

    /// A full discovery and fan-out cycle began
    CycleStarted {
        /// Attempt ID
        attempt_id: String,
        /// 1-based cycle number
        cycle: u32,
    },

    /// An endpoint confirmed the payload
    Delivered {
        /// Attempt ID
        attempt_id: String,
        /// Endpoint that confirmed
        endpoint: Endpoint,
    },

    /// A cycle failed and another is scheduled
    RetryScheduled {
        /// Attempt ID
        attempt_id: String,
        /// Failed cycles so far
        retry_count: u32,
        /// Wait before the next cycle
        delay: Duration,
    },

    /// The attempt failed permanently
    Failed {
        /// Attempt ID
        attempt_id: String,
        /// Error message
        reason: String,
    },
}

impl DeliveryEvent {
    /// Attempt this event belongs to
    pub fn attempt_id(&self) -> &str {
        match self {
            DeliveryEvent::Queued { attempt_id }
            | DeliveryEvent::CycleStarted { attempt_id, .. }
            | DeliveryEvent::Delivered { attempt_id, .. }
            | DeliveryEvent::RetryScheduled { attempt_id, .. }
            | DeliveryEvent::Failed { attempt_id, .. } => attempt_id,
        }
    }

    /// Whether no further events follow for this attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryEvent::Delivered { .. } | DeliveryEvent::Failed { .. }
        )
    }
}
