//! The configuration surface consumed at
//! [`connect()`](crate::client::ConnectionManager::connect), and contact
//! point resolution.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::net::{ToSocketAddrs, lookup_host};
use tracing::warn;

use crate::network::ConnectionConfig;
use crate::network::pool::PoolPolicy;

/// Default port applied to contact points that do not carry one.
pub const DEFAULT_PORT: u16 = 9160;

/// How a borrow behaves once every pooled connection is lent out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Suspend the caller until a connection comes back (the default),
    /// subject to the borrow timeout.
    #[default]
    Block,
    /// Fail immediately with a capacity error.
    Fail,
}

/// Everything the connectivity layer consumes at
/// [`connect()`](crate::client::ConnectionManager::connect).
///
/// Supplied programmatically by the surrounding application; there is no CLI
/// or file format here.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Initial cluster members, as hostnames, `ip` or `ip:port` strings.
    /// All of them are marked as seeds.
    pub contact_points: Vec<String>,
    /// Port for contact points that do not specify one.
    pub port: u16,
    /// Keyspace selected during every connection handshake.
    pub keyspace: String,
    /// Upper bound on concurrently borrowed connections.
    pub max_active: usize,
    /// Idle connections the evictor keeps warm.
    pub min_idle: usize,
    /// Probe a connection's liveness before lending it out.
    pub test_on_borrow: bool,
    /// Probe idle connections from the evictor.
    pub test_while_idle: bool,
    /// How often the evictor runs; `None` disables it (and `min_idle`).
    pub eviction_interval: Option<Duration>,
    /// Upper bound on waiting for a free connection; `None` blocks
    /// indefinitely.
    pub borrow_timeout: Option<Duration>,
    /// Behavior when the pool is exhausted.
    pub exhaustion: ExhaustionPolicy,
    /// How often the background topology rescan runs.
    pub cluster_poll_interval: Duration,
    /// Upper bound on establishing one physical link.
    pub connect_timeout: Duration,
    /// Whether to disable Nagle's algorithm on TCP transports.
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalives start, if keepalive is wanted.
    pub tcp_keepalive_interval: Option<Duration>,
    /// Upper bound on resolving one contact point hostname.
    pub hostname_resolution_timeout: Option<Duration>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            port: DEFAULT_PORT,
            keyspace: String::new(),
            max_active: 16,
            min_idle: 1,
            test_on_borrow: true,
            test_while_idle: true,
            eviction_interval: Some(Duration::from_secs(30)),
            borrow_timeout: None,
            exhaustion: ExhaustionPolicy::default(),
            cluster_poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl ConnectivityConfig {
    /// Config with the given contact points and keyspace, defaults elsewhere.
    pub fn new(
        contact_points: impl IntoIterator<Item = impl Into<String>>,
        keyspace: impl Into<String>,
    ) -> Self {
        Self {
            contact_points: contact_points.into_iter().map(Into::into).collect(),
            keyspace: keyspace.into(),
            ..Self::default()
        }
    }

    pub(crate) fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
        }
    }

    pub(crate) fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_active: self.max_active.max(1),
            min_idle: self.min_idle.min(self.max_active),
            test_on_borrow: self.test_on_borrow,
            test_while_idle: self.test_while_idle,
            eviction_interval: self.eviction_interval,
            borrow_timeout: self.borrow_timeout,
            exhaustion: self.exhaustion,
        }
    }
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            // Elapsed error from tokio does not provide any context.
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

// Resolve the given hostname using a DNS lookup if necessary.
// The resolution may return multiple IPs and the function returns one of them.
// It prefers to return IPv4s first, and only if there are none, IPv6s.
async fn resolve_hostname(
    hostname: &str,
    default_port: u16,
    resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    // `lookup_host` expects a "hostname:port" string and errors out
    // immediately otherwise, in which case a second lookup with the default
    // port appended is worth a try. A timeout on the first lookup makes the
    // second pointless.
    let addrs = match lookup_host_with_timeout(hostname, resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs = lookup_host_with_timeout((hostname, default_port), resolution_timeout)
                .await
                .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Turns the configured contact points into socket addresses.
///
/// Plain `ip:port` and `ip` forms are parsed directly; anything else goes
/// through a DNS lookup. Unresolvable points are logged and skipped; their
/// names are returned alongside the resolved list so the caller can report
/// a total failure.
pub(crate) async fn resolve_contact_points(
    config: &ConnectivityConfig,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut resolved: Vec<SocketAddr> = Vec::with_capacity(config.contact_points.len());
    let mut failed: Vec<String> = Vec::new();

    for point in &config.contact_points {
        if let Ok(addr) = point.parse::<SocketAddr>() {
            resolved.push(addr);
            continue;
        }
        if let Ok(ip) = point.parse::<IpAddr>() {
            resolved.push(SocketAddr::new(ip, config.port));
            continue;
        }
        match resolve_hostname(point, config.port, config.hostname_resolution_timeout).await {
            Ok(addr) => resolved.push(addr),
            Err(err) => {
                warn!(contact_point = %point, error = %err, "contact point resolution failed");
                failed.push(point.clone());
            }
        }
    }

    (resolved, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        let mut config = ConnectivityConfig::new(["10.1.2.3:7777", "10.1.2.4"], "ks");
        config.port = 9999;
        let (resolved, failed) = resolve_contact_points(&config).await;
        assert!(failed.is_empty());
        assert_eq!(
            resolved,
            vec![
                "10.1.2.3:7777".parse().unwrap(),
                "10.1.2.4:9999".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn unresolvable_hostnames_are_reported() {
        let config = ConnectivityConfig::new(["surely-not-a-real-host.invalid."], "ks");
        let (resolved, failed) = resolve_contact_points(&config).await;
        assert!(resolved.is_empty());
        assert_eq!(failed, vec!["surely-not-a-real-host.invalid.".to_owned()]);
    }

    #[test]
    fn pool_policy_clamps_min_idle() {
        let mut config = ConnectivityConfig::new(["10.0.0.1"], "ks");
        config.max_active = 2;
        config.min_idle = 10;
        let policy = config.pool_policy();
        assert_eq!(policy.min_idle, 2);
    }
}
