//! LAN Endpoint Discovery
//!
//! Finds relay endpoints by probing a TCP port on every host of the local
//! /24 subnet.
//!
//! ## Scan Strategy
//!
//! 1. **Subnet**: First non-loopback IPv4 interface, truncated to its /24 prefix
//! 2. **Batches**: Host suffixes 1-254 split into batches of 50
//! 3. **Probes**: One concurrent TCP connect per host in a batch, 200 ms
//!    connect timeout inside a 1 s probe timeout
//! 4. **Join**: A batch finishes before the next one starts, the scan
//!    returns after the last batch
//!
//! Most hosts refuse or ignore the probe. Refusals and timeouts are dropped
//! at `debug` level; any other error is logged and the scan continues.

use crate::{ProtocolError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// First host suffix probed
pub const FIRST_HOST: u8 = 1;

/// Last host suffix probed
pub const LAST_HOST: u8 = 254;

/// Probes in flight at once
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Timeout for a single connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Overall timeout for one probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// A reachable relay address, produced fresh by every scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

/// Scan tuning
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Hosts probed concurrently
    pub batch_size: usize,
    /// Timeout for one TCP connect
    pub connect_timeout: Duration,
    /// Timeout for a whole probe
    pub probe_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Outcome of a completed scan
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub endpoints: BTreeSet<Endpoint>,
    pub probed: usize,
    pub elapsed: Duration,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Reachability check for a single endpoint
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Ok(())` if something accepts connections at `endpoint`
    async fn probe(&self, endpoint: Endpoint, options: &ScanOptions) -> Result<()>;
}

/// Probes by opening (and immediately dropping) a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, endpoint: Endpoint, options: &ScanOptions) -> Result<()> {
        let addr = endpoint.socket_addr();

        let attempt = async {
            match timeout(options.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(ProtocolError::from_io_error(e, &format!("probing {}", addr))),
                Err(_) => Err(ProtocolError::DiscoveryTimeout(format!("connect to {}", addr))),
            }
        };

        timeout(options.probe_timeout, attempt)
            .await
            .map_err(|_| ProtocolError::DiscoveryTimeout(format!("probe of {}", addr)))?
    }
}

/// Concurrent subnet scanner
#[derive(Clone)]
pub struct NetworkScanner {
    options: ScanOptions,
    prober: Arc<dyn Prober>,
}

impl NetworkScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_prober(options, Arc::new(TcpProber))
    }

    pub fn with_prober(options: ScanOptions, prober: Arc<dyn Prober>) -> Self {
        Self { options, prober }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Probe `port` on hosts 1-254 of `subnet_prefix` (e.g. `"192.168.1"`)
    ///
    /// Returns once every probe has finished.
    pub async fn discover_reachable(&self, subnet_prefix: &str, port: u16) -> Result<ScanReport> {
        let octets = parse_prefix(subnet_prefix)?;
        let batch_size = self.options.batch_size.max(1);
        let started = Instant::now();

        let found: Arc<Mutex<HashSet<Endpoint>>> = Arc::new(Mutex::new(HashSet::new()));
        let hosts: Vec<u8> = (FIRST_HOST..=LAST_HOST).collect();

        debug!(
            "Scanning {}.0/24 port {} in batches of {}",
            subnet_prefix, port, batch_size
        );

        for batch in hosts.chunks(batch_size) {
            let probes = batch.iter().map(|&host| {
                let endpoint = Endpoint::new(
                    Ipv4Addr::new(octets[0], octets[1], octets[2], host),
                    port,
                );
                let prober = self.prober.clone();
                let options = self.options.clone();
                let found = found.clone();

                tokio::spawn(async move {
                    match prober.probe(endpoint, &options).await {
                        Ok(()) => {
                            debug!("Endpoint {} is reachable", endpoint);
                            found.lock().await.insert(endpoint);
                        }
                        Err(
                            ProtocolError::DiscoveryTimeout(_)
                            | ProtocolError::Timeout(_)
                            | ProtocolError::ConnectionRefused(_),
                        ) => {}
                        Err(e) => warn!("Probe of {} failed: {}", endpoint, e),
                    }
                })
            });

            for joined in join_all(probes).await {
                if let Err(e) = joined {
                    warn!("Probe task failed: {}", e);
                }
            }
        }

        let endpoints: BTreeSet<Endpoint> = found.lock().await.iter().copied().collect();
        let report = ScanReport {
            endpoints,
            probed: hosts.len(),
            elapsed: started.elapsed(),
        };

        info!(
            "Scan of {}.0/24 found {} endpoint(s) in {:?}",
            subnet_prefix,
            report.endpoints.len(),
            report.elapsed
        );
        Ok(report)
    }

    /// Scan the subnet of the first non-loopback IPv4 interface
    pub async fn discover_local(&self, port: u16) -> Result<ScanReport> {
        let prefix = local_subnet_prefix().ok_or_else(|| {
            ProtocolError::NetworkUnreachable("no non-loopback IPv4 interface".to_string())
        })?;
        self.discover_reachable(&prefix, port).await
    }
}

/// /24 prefix of the first non-loopback IPv4 interface, e.g. `"192.168.1"`
///
/// `None` when no such interface exists.
pub fn local_subnet_prefix() -> Option<String> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to enumerate interfaces: {}", e);
            return None;
        }
    };

    addrs
        .filter_map(|ifaddr| {
            let sin = ifaddr.address.as_ref()?.as_sockaddr_in().copied()?;
            let ip = *SocketAddrV4::from(sin).ip();
            Some((ifaddr.interface_name, ip))
        })
        .find(|(_, ip)| is_candidate(IpAddr::V4(*ip)))
        .map(|(name, ip)| {
            debug!("Using interface {} ({})", name, ip);
            subnet_prefix_of(ip)
        })
}

/// Everything before the final octet
pub fn subnet_prefix_of(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}", a, b, c)
}

fn is_candidate(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

fn parse_prefix(prefix: &str) -> Result<[u8; 3]> {
    let trimmed = prefix.trim().trim_end_matches('.');
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() != 3 {
        return Err(ProtocolError::Configuration(format!(
            "subnet prefix must have three octets: {:?}",
            prefix
        )));
    }

    let mut octets = [0u8; 3];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| {
            ProtocolError::Configuration(format!("invalid octet {:?} in {:?}", part, prefix))
        })?;
    }
    Ok(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Answers from a fixed set of reachable host suffixes
    struct SimulatedProber {
        reachable: HashSet<u8>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SimulatedProber {
        fn new(reachable: impl IntoIterator<Item = u8>) -> Self {
            Self {
                reachable: reachable.into_iter().collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for SimulatedProber {
        async fn probe(&self, endpoint: Endpoint, _options: &ScanOptions) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let host = endpoint.address.octets()[3];
            if self.reachable.contains(&host) {
                Ok(())
            } else if host % 3 == 0 {
                Err(ProtocolError::DiscoveryTimeout("simulated".to_string()))
            } else if host % 3 == 1 {
                Err(ProtocolError::ConnectionRefused("simulated".to_string()))
            } else {
                Err(ProtocolError::NetworkError("simulated".to_string()))
            }
        }
    }

    fn suffixes(report: &ScanReport) -> Vec<u8> {
        report.endpoints.iter().map(|e| e.address.octets()[3]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_finds_exactly_reachable_hosts() {
        let reachable = vec![1u8, 49, 50, 51, 100, 101, 200, 254];
        let prober = Arc::new(SimulatedProber::new(reachable.clone()));
        let scanner = NetworkScanner::with_prober(ScanOptions::default(), prober.clone());

        let report = scanner.discover_reachable("10.0.0", 9224).await.unwrap();

        assert_eq!(suffixes(&report), reachable);
        assert!(report.endpoints.iter().all(|e| e.port == 9224));
        assert_eq!(report.probed, 254);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 254);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_bound_concurrency() {
        let prober = Arc::new(SimulatedProber::new([]));
        let scanner = NetworkScanner::with_prober(ScanOptions::default(), prober.clone());

        let report = scanner.discover_reachable("10.0.0", 9224).await.unwrap();

        assert!(report.is_empty());
        let max = prober.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= DEFAULT_BATCH_SIZE, "{} probes in flight", max);
        assert!(max > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_batch_size() {
        let prober = Arc::new(SimulatedProber::new([7, 8, 9, 253]));
        let options = ScanOptions {
            batch_size: 7,
            ..Default::default()
        };
        let scanner = NetworkScanner::with_prober(options, prober.clone());

        let report = scanner.discover_reachable("192.168.4.", 80).await.unwrap();
        assert_eq!(suffixes(&report), vec![7, 8, 9, 253]);
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 7);
    }

    #[tokio::test]
    async fn test_loopback_scan() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let scanner = NetworkScanner::new(ScanOptions::default());
        let report = scanner.discover_reachable("127.0.0", port).await.unwrap();

        assert!(report
            .endpoints
            .contains(&Endpoint::new(Ipv4Addr::LOCALHOST, port)));
    }

    #[tokio::test]
    async fn test_invalid_prefix() {
        let scanner = NetworkScanner::new(ScanOptions::default());
        for prefix in ["10.0", "10.0.0.0.1", "300.1.1", "a.b.c"] {
            assert!(matches!(
                scanner.discover_reachable(prefix, 9224).await,
                Err(ProtocolError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_subnet_prefix_of() {
        assert_eq!(subnet_prefix_of(Ipv4Addr::new(192, 168, 1, 37)), "192.168.1");
        assert_eq!(subnet_prefix_of(Ipv4Addr::new(10, 0, 0, 1)), "10.0.0");
    }

    #[test]
    fn test_local_subnet_prefix_shape() {
        // Sandboxed runners may have only a loopback interface
        if let Some(prefix) = local_subnet_prefix() {
            assert_eq!(prefix.split('.').count(), 3);
            assert!(!prefix.starts_with("127."));
        }
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new(Ipv4Addr::new(10, 0, 0, 7), 9224);
        assert_eq!(endpoint.to_string(), "10.0.0.7:9224");
        assert_eq!(endpoint.socket_addr().port(), 9224);
    }
}
