//! Reliable Delivery
//!
//! Queue of outbound payloads driven through discovery, concurrent relay
//! sessions and exponential backoff between cycles.

pub mod backoff;
pub mod events;
pub mod queue;

pub use backoff::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES};
pub use events::DeliveryEvent;
pub use queue::{
    AttemptOutcome, Deliverer, DeliveryAttempt, DeliveryConfig, DeliveryQueue, EndpointSource,
    LanDiscovery,
};
