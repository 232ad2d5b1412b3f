//! Delivery queue
//!
//! Each queued attempt runs as its own task through up to `max_retries`
//! full cycles. A cycle discovers endpoints, opens one session per endpoint
//! concurrently and succeeds on the first confirmation, cancelling the
//! sessions still running. A cycle with no endpoints or no confirmation
//! schedules the next one after an exponentially growing delay.

use super::backoff::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES};
use super::events::DeliveryEvent;
use crate::discovery::{Endpoint, NetworkScanner};
use crate::relay::{RelayClient, RelayPayload};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Delivery queue configuration
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Full cycles before an attempt fails permanently
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Where a delivery cycle gets its endpoints
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Endpoint>>;
}

/// One session to one endpoint
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// `Ok(())` only when the endpoint confirmed the payload
    async fn deliver(&self, endpoint: Endpoint, payload: &RelayPayload) -> Result<()>;
}

/// Discovers endpoints by scanning the LAN
pub struct LanDiscovery {
    scanner: NetworkScanner,
    port: u16,
    /// Scan this prefix instead of the local interface's
    subnet_prefix: Option<String>,
}

impl LanDiscovery {
    pub fn new(scanner: NetworkScanner, port: u16, subnet_prefix: Option<String>) -> Self {
        Self {
            scanner,
            port,
            subnet_prefix,
        }
    }
}

#[async_trait]
impl EndpointSource for LanDiscovery {
    async fn discover(&self) -> Result<Vec<Endpoint>> {
        let report = match &self.subnet_prefix {
            Some(prefix) => self.scanner.discover_reachable(prefix, self.port).await?,
            None => self.scanner.discover_local(self.port).await?,
        };
        Ok(report.endpoints.into_iter().collect())
    }
}

#[async_trait]
impl Deliverer for RelayClient {
    async fn deliver(&self, endpoint: Endpoint, payload: &RelayPayload) -> Result<()> {
        self.send(endpoint, payload).await.map(|_| ())
    }
}

/// A queued payload and its retry state
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub attempt_id: String,
    pub payload: RelayPayload,
    /// Failed full cycles so far
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Final result of one attempt
#[derive(Debug)]
pub struct AttemptOutcome {
    pub attempt_id: String,
    /// Confirming endpoint, [`ProtocolError::RetriesExhausted`], or the
    /// unrecoverable error that stopped the attempt early
    pub result: Result<Endpoint>,
}

impl AttemptOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone)]
struct CycleContext {
    config: DeliveryConfig,
    source: Arc<dyn EndpointSource>,
    deliverer: Arc<dyn Deliverer>,
    event_tx: mpsc::UnboundedSender<DeliveryEvent>,
}

/// Retry orchestrator above the relay sessions
pub struct DeliveryQueue {
    context: CycleContext,

    /// Attempts waiting for the next run
    pending: Mutex<VecDeque<DeliveryAttempt>>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<DeliveryEvent>>>,
}

impl DeliveryQueue {
    pub fn new(
        config: DeliveryConfig,
        source: Arc<dyn EndpointSource>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            context: CycleContext {
                config,
                source,
                deliverer,
                event_tx,
            },
            pending: Mutex::new(VecDeque::new()),
            event_rx: Arc::new(RwLock::new(event_rx)),
        }
    }

    /// Get a receiver for delivery events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<DeliveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward events
        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Queue a payload, returning its attempt id
    pub async fn enqueue(&self, payload: RelayPayload) -> String {
        let attempt = DeliveryAttempt {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        };
        let attempt_id = attempt.attempt_id.clone();

        debug!("Queued {} as {}", attempt.payload.describe(), attempt_id);
        self.pending.lock().await.push_back(attempt);
        let _ = self.context.event_tx.send(DeliveryEvent::Queued {
            attempt_id: attempt_id.clone(),
        });

        attempt_id
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn take_pending(&self) -> Vec<DeliveryAttempt> {
        self.pending.lock().await.drain(..).collect()
    }

    /// Drive every pending attempt to completion, one task per attempt
    pub async fn run_pending(&self) -> Vec<AttemptOutcome> {
        let attempts = self.take_pending().await;
        if attempts.is_empty() {
            return Vec::new();
        }
        debug!("Running {} pending attempt(s)", attempts.len());

        let tasks = attempts.into_iter().map(|attempt| {
            let attempt_id = attempt.attempt_id.clone();
            let context = self.context.clone();
            (attempt_id, tokio::spawn(run_attempt(attempt, context)))
        });
        let (ids, handles): (Vec<String>, Vec<JoinHandle<AttemptOutcome>>) = tasks.unzip();

        join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, attempt_id)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Delivery task for {} failed: {}", attempt_id, e);
                    AttemptOutcome {
                        attempt_id,
                        result: Err(ProtocolError::Cancelled(e.to_string())),
                    }
                }
            })
            .collect()
    }

    /// Start pending attempts in the background on every tick
    ///
    /// Attempts already running keep going between ticks, so a new attempt
    /// never waits for an older one to finish its retries. Aborting the
    /// returned handle cancels every attempt still in flight.
    pub fn spawn_worker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for attempt in queue.take_pending().await {
                            debug!("Starting attempt {}", attempt.attempt_id);
                            in_flight.spawn(run_attempt(attempt, queue.context.clone()));
                        }
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                        Ok(outcome) => debug!(
                            "Attempt {} finished, delivered: {}",
                            outcome.attempt_id,
                            outcome.is_delivered()
                        ),
                        Err(e) => error!("Delivery task failed: {}", e),
                    },
                }
            }
        })
    }
}

async fn run_attempt(mut attempt: DeliveryAttempt, context: CycleContext) -> AttemptOutcome {
    let config = &context.config;
    let mut policy = RetryPolicy::for_cycles(config.max_retries, config.base_delay, config.max_delay);

    loop {
        let _ = context.event_tx.send(DeliveryEvent::CycleStarted {
            attempt_id: attempt.attempt_id.clone(),
            cycle: attempt.retry_count + 1,
        });

        let error = match run_cycle(&attempt, &context).await {
            Ok(endpoint) => {
                info!("Attempt {} delivered to {}", attempt.attempt_id, endpoint);
                let _ = context.event_tx.send(DeliveryEvent::Delivered {
                    attempt_id: attempt.attempt_id.clone(),
                    endpoint,
                });
                return AttemptOutcome {
                    attempt_id: attempt.attempt_id,
                    result: Ok(endpoint),
                };
            }
            Err(e) => e,
        };

        attempt.retry_count += 1;
        if !error.is_recoverable() {
            warn!("Attempt {} cannot be delivered: {}", attempt.attempt_id, error);
            let _ = context.event_tx.send(DeliveryEvent::Failed {
                attempt_id: attempt.attempt_id.clone(),
                reason: error.to_string(),
            });
            return AttemptOutcome {
                attempt_id: attempt.attempt_id,
                result: Err(error),
            };
        }

        match policy.next_delay() {
            Some(delay) => {
                debug!(
                    "Attempt {} cycle {} failed ({}), retrying in {:?}",
                    attempt.attempt_id, attempt.retry_count, error, delay
                );
                let _ = context.event_tx.send(DeliveryEvent::RetryScheduled {
                    attempt_id: attempt.attempt_id.clone(),
                    retry_count: attempt.retry_count,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(
                    "Attempt {} failed after {} cycle(s): {}",
                    attempt.attempt_id, attempt.retry_count, error
                );
                let _ = context.event_tx.send(DeliveryEvent::Failed {
                    attempt_id: attempt.attempt_id.clone(),
                    reason: error.to_string(),
                });
                return AttemptOutcome {
                    result: Err(ProtocolError::RetriesExhausted {
                        attempt_id: attempt.attempt_id.clone(),
                        cycles: attempt.retry_count,
                        last_error: Box::new(error),
                    }),
                    attempt_id: attempt.attempt_id,
                };
            }
        }
    }
}

/// One discovery plus fan-out; the first confirmation wins
async fn run_cycle(attempt: &DeliveryAttempt, context: &CycleContext) -> Result<Endpoint> {
    let endpoints = context.source.discover().await?;
    if endpoints.is_empty() {
        return Err(ProtocolError::NoDeviceReachable);
    }

    let mut sessions = JoinSet::new();
    for endpoint in endpoints {
        let deliverer = context.deliverer.clone();
        let payload = attempt.payload.clone();
        sessions.spawn(async move { (endpoint, deliverer.deliver(endpoint, &payload).await) });
    }

    let mut last_error = None;
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok((endpoint, Ok(()))) => {
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
                return Ok(endpoint);
            }
            Ok((endpoint, Err(e))) => {
                debug!("Session to {} failed: {}", endpoint, e);
                last_error = Some(e);
            }
            Err(e) => error!("Session task failed: {}", e),
        }
    }

    Err(last_error.unwrap_or(ProtocolError::NoDeviceReachable))
}
