//! Shared in-process overlay network.
//!
//! Maps overlay addresses to the stacks that own them, keeps the machine
//! directory and pending interactive logins, and lets tests present
//! synthetic inbound flows to a node.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::io::DuplexStream;

use crate::net::conn::PacketConn;
use crate::sim::backend::MemBackend;
use crate::sim::stack::MemStack;

const CGNAT_BASE: u32 = u32::from_be_bytes([100, 64, 0, 0]);
const CGNAT_HOSTS: u32 = 1 << 22;
const ULA_PREFIX: [u16; 3] = [0xfd7a, 0x115c, 0xa1e0];

/// A node registered on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub hostname: String,
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
    pub ephemeral: bool,
}

impl Machine {
    pub fn addresses(&self) -> Vec<IpAddr> {
        vec![IpAddr::V4(self.v4), IpAddr::V6(self.v6)]
    }
}

#[derive(Default)]
pub struct MemNetwork {
    stacks: DashMap<IpAddr, Weak<MemStack>>,
    machines: DashMap<String, Machine>,
    allocated: DashSet<Ipv4Addr>,
    pending_logins: DashMap<String, Weak<MemBackend>>,
    valid_keys: RwLock<Option<HashSet<String>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept only these join keys. Without a restriction any non-empty key joins.
    pub fn restrict_auth_keys<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        *self.valid_keys.write().unwrap_or_else(PoisonError::into_inner) = Some(keys);
    }

    pub fn accepts_key(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        match &*self.valid_keys.read().unwrap_or_else(PoisonError::into_inner) {
            Some(keys) => keys.contains(key),
            None => true,
        }
    }

    /// Reserve unused addresses from 100.64.0.0/10 and the matching ULA.
    ///
    /// The reservation holds until the machine using it is removed or
    /// [`release`](Self::release) is called.
    pub(crate) fn allocate(&self) -> (Ipv4Addr, Ipv6Addr) {
        loop {
            let host = fastrand::u32(1..CGNAT_HOSTS - 1);
            let v4 = Ipv4Addr::from(CGNAT_BASE + host);
            if self.allocated.insert(v4) {
                let bits = u32::from(v4);
                let v6 = Ipv6Addr::new(
                    ULA_PREFIX[0],
                    ULA_PREFIX[1],
                    ULA_PREFIX[2],
                    0,
                    0,
                    0,
                    (bits >> 16) as u16,
                    bits as u16,
                );
                return (v4, v6);
            }
        }
    }

    /// Give back an address that never made it into a registered machine.
    pub(crate) fn release(&self, v4: Ipv4Addr) {
        self.allocated.remove(&v4);
    }

    pub(crate) fn register_machine(&self, machine: Machine) {
        tracing::debug!(id = %machine.id, hostname = %machine.hostname, v4 = %machine.v4, "Machine joined");
        self.allocated.insert(machine.v4);
        self.machines.insert(machine.id.clone(), machine);
    }

    pub(crate) fn remove_machine(&self, id: &str) {
        if let Some((_, machine)) = self.machines.remove(id) {
            tracing::debug!(id = %machine.id, hostname = %machine.hostname, "Machine left");
            self.allocated.remove(&machine.v4);
        }
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.machines.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn machine_for_ip(&self, ip: IpAddr) -> Option<Machine> {
        self.machines
            .iter()
            .find(|entry| entry.v4 == ip || entry.v6 == ip)
            .map(|entry| entry.value().clone())
    }

    /// Register `url` as `backend`'s only pending login.
    pub(crate) fn add_pending_login(&self, url: &str, backend: Weak<MemBackend>) {
        self.pending_logins
            .retain(|_, owner| owner.strong_count() > 0 && !owner.ptr_eq(&backend));
        self.pending_logins.insert(url.to_string(), backend);
    }

    pub(crate) fn forget_pending_logins(&self, backend: &Weak<MemBackend>) {
        self.pending_logins.retain(|_, owner| !owner.ptr_eq(backend));
    }

    pub fn pending_logins(&self) -> usize {
        self.pending_logins.len()
    }

    /// Act as the user approving the node at its authorization URL.
    pub fn visit_auth_url(&self, url: &str) -> io::Result<()> {
        let backend = self
            .pending_logins
            .remove(url)
            .and_then(|(_, backend)| backend.upgrade())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no pending login at {url}")))?;
        backend
            .complete_login()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    pub(crate) fn attach(&self, ip: IpAddr, stack: &Arc<MemStack>) {
        self.stacks.insert(ip, Arc::downgrade(stack));
    }

    pub(crate) fn detach(&self, ip: IpAddr, stack: &MemStack) {
        self.stacks
            .remove_if(&ip, |_, owner| std::ptr::eq(owner.as_ptr(), stack));
    }

    fn stack_for(&self, dst: SocketAddr) -> io::Result<Arc<MemStack>> {
        self.stacks
            .get(&dst.ip())
            .and_then(|entry| entry.upgrade())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("no overlay node at {}", dst.ip()))
            })
    }

    /// Present an inbound TCP flow from `src` to the node owning `dst`.
    /// Returns the initiator's end of the connection.
    pub fn inject_tcp(&self, src: SocketAddr, dst: SocketAddr) -> io::Result<DuplexStream> {
        self.stack_for(dst)?.accept_tcp(src, dst)
    }

    /// Present an inbound UDP flow. Returns the initiator's packet end.
    pub fn inject_udp(&self, src: SocketAddr, dst: SocketAddr) -> io::Result<PacketConn> {
        self.stack_for(dst)?.accept_udp(src, dst)
    }
}
