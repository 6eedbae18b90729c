//! Listener registry keyed by (network, bind address, port).
//!
//! # Responsibilities
//! - Reject duplicate bindings
//! - Resolve an inbound destination to the most specific listener
//! - Unregister only the exact listener that owns a key
//!
//! # Design Decisions
//! - One mutex guards the whole map; every operation is a short critical
//!   section with no I/O, so a resolve always sees a consistent snapshot
//! - Transport is part of the network value, so TCP and UDP bindings can
//!   never resolve to each other

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::net::listener::ListenerEntry;
use crate::observability::metrics;

/// Transport class of a flow, without address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// A listen/dial network name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    /// The network without a family suffix.
    pub fn base(transport: Transport) -> Self {
        match transport {
            Transport::Tcp => Network::Tcp,
            Transport::Udp => Network::Udp,
        }
    }

    /// The family-specific network for a destination of the given version.
    pub fn for_family(transport: Transport, is_v6: bool) -> Self {
        match (transport, is_v6) {
            (Transport::Tcp, false) => Network::Tcp4,
            (Transport::Tcp, true) => Network::Tcp6,
            (Transport::Udp, false) => Network::Udp4,
            (Transport::Udp, true) => Network::Udp6,
        }
    }

    pub fn transport(self) -> Transport {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => Transport::Tcp,
            Network::Udp | Network::Udp4 | Network::Udp6 => Transport::Udp,
        }
    }

    /// Whether an address of this version is acceptable for the network.
    pub fn admits(self, ip: IpAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
            Network::Tcp | Network::Udp => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ListenSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(ListenSpecError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Why a (network, address) pair could not be turned into a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenSpecError {
    #[error("unsupported network type {0:?}")]
    UnsupportedNetwork(String),

    #[error("address {0:?}: missing port")]
    MissingPort(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid listen addr {0:?}; host part must be empty or an IP literal")]
    InvalidHost(String),

    #[error("address {addr} does not belong to network {network}")]
    FamilyMismatch { network: Network, addr: IpAddr },
}

/// Unique registry key. `host == None` is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub network: Network,
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ListenKey {
    pub fn new(network: Network, host: Option<IpAddr>, port: u16) -> Self {
        // Unspecified addresses bind every interface, same as an empty host.
        let host = host
            .map(|ip| ip.to_canonical())
            .filter(|ip| !ip.is_unspecified());
        Self {
            network,
            host,
            port,
        }
    }

    /// Parse a listen request such as `("tcp", ":80")` or `("udp6", "[fd7a::1]:53")`.
    pub fn parse(network: &str, addr: &str) -> Result<Self, ListenSpecError> {
        let network: Network = network.parse()?;
        let (host, port) = split_host_port(addr)?;
        let port = parse_port(port)?;

        let host = if host.is_empty() {
            None
        } else {
            let ip: IpAddr = host
                .parse()
                .map_err(|_| ListenSpecError::InvalidHost(host.to_string()))?;
            if !network.admits(ip) {
                return Err(ListenSpecError::FamilyMismatch { network, addr: ip });
            }
            Some(ip)
        };

        Ok(Self::new(network, host, port))
    }
}

impl fmt::Display for ListenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(ip) => write!(f, "{} {}", self.network, SocketAddr::new(ip, self.port)),
            None => write!(f, "{} *:{}", self.network, self.port),
        }
    }
}

fn split_host_port(addr: &str) -> Result<(&str, &str), ListenSpecError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ListenSpecError::InvalidHost(addr.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ListenSpecError::MissingPort(addr.to_string()))?;
        return Ok((host, port));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ListenSpecError::MissingPort(addr.to_string()))?;
    if host.contains(':') {
        // Bare IPv6 literal without brackets.
        return Err(ListenSpecError::InvalidHost(addr.to_string()));
    }
    Ok((host, port))
}

fn parse_port(port: &str) -> Result<u16, ListenSpecError> {
    if let Ok(n) = port.parse::<u16>() {
        return Ok(n);
    }
    let known = match port {
        "ssh" => 22,
        "domain" | "dns" => 53,
        "http" => 80,
        "https" => 443,
        _ => return Err(ListenSpecError::InvalidPort(port.to_string())),
    };
    Ok(known)
}

/// Errors from registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("listener already open for {0}")]
    AlreadyBound(ListenKey),

    #[error("registry is closed")]
    Closed,
}

#[derive(Default)]
struct RegistryState {
    listeners: HashMap<ListenKey, Arc<ListenerEntry>>,
    closed: bool,
}

/// Concurrency-safe map of live listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a listener under its key. Never overwrites.
    pub fn register(&self, entry: Arc<ListenerEntry>) -> Result<(), RegistryError> {
        let key = *entry.key();
        let mut state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.listeners.contains_key(&key) {
            return Err(RegistryError::AlreadyBound(key));
        }
        state.listeners.insert(key, entry);
        metrics::record_listeners(state.listeners.len());
        tracing::debug!(key = %key, "Listener registered");
        Ok(())
    }

    /// Remove `entry` if and only if it is the listener stored under its key,
    /// closing its handoff channel while the lock is held.
    pub fn unregister(&self, entry: &Arc<ListenerEntry>) -> bool {
        let mut state = self.lock();
        let owned = state
            .listeners
            .get(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if !owned {
            return false;
        }
        state.listeners.remove(entry.key());
        entry.close();
        metrics::record_listeners(state.listeners.len());
        tracing::debug!(key = %entry.key(), "Listener unregistered");
        true
    }

    /// Most specific listener for a destination:
    /// (family, ip, port), (base, ip, port), (family, *, port), (base, *, port).
    pub fn resolve(&self, transport: Transport, dst: SocketAddr) -> Option<Arc<ListenerEntry>> {
        let ip = dst.ip().to_canonical();
        let family = Network::for_family(transport, ip.is_ipv6());
        let base = Network::base(transport);
        let candidates = [
            ListenKey::new(family, Some(ip), dst.port()),
            ListenKey::new(base, Some(ip), dst.port()),
            ListenKey::new(family, None, dst.port()),
            ListenKey::new(base, None, dst.port()),
        ];

        let state = self.lock();
        candidates
            .iter()
            .find_map(|key| state.listeners.get(key))
            .cloned()
    }

    /// Keys of every live listener.
    pub fn keys(&self) -> Vec<ListenKey> {
        self.lock().listeners.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every listener, clear the map and refuse further registrations.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let count = state.listeners.len();
        for (_, entry) in state.listeners.drain() {
            entry.close();
        }
        metrics::record_listeners(0);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn entry(network: Network, host: Option<IpAddr>, port: u16) -> Arc<ListenerEntry> {
        ListenerEntry::detached(ListenKey::new(network, host, port))
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn parse_listen_specs() {
        let key = ListenKey::parse("tcp", ":80").unwrap();
        assert_eq!(key, ListenKey::new(Network::Tcp, None, 80));

        let key = ListenKey::parse("", "0.0.0.0:http").unwrap();
        assert_eq!(key.host, None);
        assert_eq!(key.port, 80);

        let key = ListenKey::parse("udp6", "[fd7a:115c:a1e0::1]:53").unwrap();
        assert_eq!(key.network, Network::Udp6);
        assert!(key.host.unwrap().is_ipv6());

        assert!(matches!(
            ListenKey::parse("unix", ":80"),
            Err(ListenSpecError::UnsupportedNetwork(_))
        ));
        assert!(matches!(
            ListenKey::parse("tcp", "80"),
            Err(ListenSpecError::MissingPort(_))
        ));
        assert!(matches!(
            ListenKey::parse("tcp", "example.com:80"),
            Err(ListenSpecError::InvalidHost(_))
        ));
        assert!(matches!(
            ListenKey::parse("tcp", ":99999"),
            Err(ListenSpecError::InvalidPort(_))
        ));
        assert!(matches!(
            ListenKey::parse("tcp4", "[::1]:80"),
            Err(ListenSpecError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_register_keeps_original() {
        let registry = ListenerRegistry::new();
        let first = entry(Network::Tcp, None, 80);
        let second = entry(Network::Tcp, None, 80);

        registry.register(first.clone()).unwrap();
        assert_eq!(
            registry.register(second),
            Err(RegistryError::AlreadyBound(*first.key()))
        );

        let found = registry.resolve(Transport::Tcp, "100.64.0.1:80".parse().unwrap());
        assert!(Arc::ptr_eq(&found.unwrap(), &first));
    }

    #[test]
    fn resolve_prefers_most_specific() {
        let registry = ListenerRegistry::new();
        let specific = entry(Network::Tcp4, Some(v4(1, 2, 3, 4)), 80);
        let wildcard = entry(Network::Tcp, Some(v4(0, 0, 0, 0)), 80);
        registry.register(specific.clone()).unwrap();
        registry.register(wildcard.clone()).unwrap();

        let dst: SocketAddr = "1.2.3.4:80".parse().unwrap();
        let found = registry.resolve(Transport::Tcp, dst).unwrap();
        assert!(Arc::ptr_eq(&found, &specific));

        assert!(registry.unregister(&specific));
        let found = registry.resolve(Transport::Tcp, dst).unwrap();
        assert!(Arc::ptr_eq(&found, &wildcard));
    }

    #[test]
    fn resolve_order_between_base_and_family() {
        let registry = ListenerRegistry::new();
        let base_exact = entry(Network::Tcp, Some(v4(10, 0, 0, 1)), 443);
        let family_any = entry(Network::Tcp4, None, 443);
        registry.register(family_any.clone()).unwrap();
        registry.register(base_exact.clone()).unwrap();

        // An exact address beats a family match on the wildcard.
        let found = registry
            .resolve(Transport::Tcp, "10.0.0.1:443".parse().unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&found, &base_exact));

        let found = registry
            .resolve(Transport::Tcp, "10.0.0.2:443".parse().unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&found, &family_any));

        // IPv6 traffic does not match a tcp4 binding.
        assert!(registry
            .resolve(Transport::Tcp, "[fd7a::2]:443".parse().unwrap())
            .is_none());
    }

    #[test]
    fn transports_never_cross_resolve() {
        let registry = ListenerRegistry::new();
        let udp = entry(Network::Udp, None, 53);
        let tcp = entry(Network::Tcp4, Some(v4(100, 64, 0, 7)), 53);
        registry.register(udp.clone()).unwrap();
        registry.register(tcp.clone()).unwrap();

        let dst: SocketAddr = "100.64.0.7:53".parse().unwrap();
        let for_udp = registry.resolve(Transport::Udp, dst).unwrap();
        let for_tcp = registry.resolve(Transport::Tcp, dst).unwrap();
        assert!(Arc::ptr_eq(&for_udp, &udp));
        assert!(Arc::ptr_eq(&for_tcp, &tcp));

        let other: SocketAddr = "100.64.0.8:53".parse().unwrap();
        assert!(registry.resolve(Transport::Tcp, other).is_none());
    }

    #[test]
    fn stale_unregister_is_noop() {
        let registry = ListenerRegistry::new();
        let live = entry(Network::Tcp, None, 8080);
        let stale = entry(Network::Tcp, None, 8080);
        registry.register(live.clone()).unwrap();

        assert!(!registry.unregister(&stale));
        assert!(!live.is_closed());
        let found = registry
            .resolve(Transport::Tcp, "100.64.0.1:8080".parse().unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&found, &live));
    }

    #[test]
    fn close_all_closes_and_rejects() {
        let registry = ListenerRegistry::new();
        let a = entry(Network::Tcp, None, 1);
        let b = entry(Network::Udp, None, 2);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
        assert_eq!(
            registry.register(entry(Network::Tcp, None, 3)),
            Err(RegistryError::Closed)
        );
    }
}
