//! LAN discovery: advertise the shared directory over mDNS and resolve peers to addresses.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use async_trait::async_trait;
use drop_core::PROTOCOL_VERSION;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{DropError, Result};

pub const UID_KEY: &str = "uid";
pub const DROPLET_KEY: &str = "droplet";

/// A resolved peer. Consumed once by connection establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub instance: String,
    pub host: String,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl PeerAddress {
    pub fn uid(&self) -> Option<&str> {
        self.metadata.get(UID_KEY).map(String::as_str)
    }

    /// Advertised display host; the TLS server name of the peer.
    pub fn droplet(&self) -> Option<&str> {
        self.metadata.get(DROPLET_KEY).map(String::as_str)
    }

    /// Dial candidates: every IPv4 address in listed order, then every IPv6 address.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.ipv4
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), self.port))
            .chain(
                self.ipv6
                    .iter()
                    .map(|ip| SocketAddr::new(IpAddr::V6(*ip), self.port)),
            )
            .collect()
    }

    fn is_usable(&self) -> bool {
        self.port != 0 && !(self.ipv4.is_empty() && self.ipv6.is_empty())
    }
}

/// What a node advertises about itself.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance: String,
    pub droplet: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl ServiceRegistration {
    pub fn new(uid: &str, droplet: &str, ip: Ipv4Addr, port: u16) -> Self {
        let metadata = [
            ("version", PROTOCOL_VERSION),
            ("name", "drop"),
            (UID_KEY, uid),
            (DROPLET_KEY, droplet),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            instance: uid.to_string(),
            droplet: droplet.to_string(),
            ip,
            port,
            metadata,
        }
    }
}

/// Discovery collaborator. Browsing and lookups are bounded by `timeout`.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every peer resolved within `timeout` (possibly none).
    async fn browse(&self, timeout: Duration) -> Result<Vec<PeerAddress>>;

    /// First resolved peer named `instance` that has an address and a port.
    async fn lookup(&self, instance: &str, timeout: Duration) -> Result<PeerAddress>;

    fn register(&self, service: &ServiceRegistration) -> Result<()>;
}

/// mDNS discovery on a background responder thread.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
}

fn mdns_err(e: mdns_sd::Error) -> DropError {
    DropError::Discovery(e.to_string())
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>) -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new().map_err(mdns_err)?,
            service_type: service_type.into(),
        })
    }

    fn peer_from(&self, info: &ServiceInfo) -> PeerAddress {
        let fullname = info.get_fullname();
        let instance = fullname
            .strip_suffix(&self.service_type)
            .map(|s| s.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string();
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        for ip in info.get_addresses() {
            match ip {
                IpAddr::V4(v4) => ipv4.push(*v4),
                IpAddr::V6(v6) => ipv6.push(*v6),
            }
        }
        ipv4.sort();
        ipv6.sort();
        let metadata = info
            .get_properties()
            .iter()
            .map(|p| (p.key().to_string(), p.val_str().to_string()))
            .collect();
        PeerAddress {
            instance,
            host: info.get_hostname().trim_end_matches('.').to_string(),
            ipv4,
            ipv6,
            port: info.get_port(),
            metadata,
        }
    }

    /// Run one browse until `accept` returns a peer or the deadline passes.
    async fn scan(
        &self,
        timeout: Duration,
        mut accept: impl FnMut(PeerAddress) -> Option<PeerAddress>,
    ) -> Result<Option<PeerAddress>> {
        let events = self.daemon.browse(&self.service_type).map_err(mdns_err)?;
        let deadline = Instant::now() + timeout;
        let mut found = None;
        while let Ok(event) = tokio::time::timeout_at(deadline, events.recv_async()).await {
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let peer = self.peer_from(&info);
                    debug!("resolved {} at {:?}:{}", peer.instance, peer.ipv4, peer.port);
                    if let Some(peer) = accept(peer) {
                        found = Some(peer);
                        break;
                    }
                }
                Ok(other) => debug!("mdns event: {:?}", other),
                Err(_) => break,
            }
        }
        // Stop querying once the caller has what it needs (or time is up).
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!("stop_browse: {}", e);
        }
        Ok(found)
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn browse(&self, timeout: Duration) -> Result<Vec<PeerAddress>> {
        let mut peers: Vec<PeerAddress> = Vec::new();
        self.scan(timeout, |peer| {
            if !peers.iter().any(|p| p.instance == peer.instance) {
                peers.push(peer);
            }
            None
        })
        .await?;
        Ok(peers)
    }

    async fn lookup(&self, instance: &str, timeout: Duration) -> Result<PeerAddress> {
        self.scan(timeout, |peer| {
            (peer.instance == instance && peer.is_usable()).then_some(peer)
        })
        .await?
        .ok_or_else(|| DropError::ServiceNotFound(instance.to_string()))
    }

    fn register(&self, service: &ServiceRegistration) -> Result<()> {
        let host_name = if service.droplet.ends_with('.') {
            service.droplet.clone()
        } else {
            format!("{}.", service.droplet)
        };
        let info = ServiceInfo::new(
            &self.service_type,
            &service.instance,
            &host_name,
            IpAddr::V4(service.ip),
            service.port,
            service.metadata.clone(),
        )
        .map_err(mdns_err)?;
        self.daemon.register(info).map_err(mdns_err)?;
        info!(
            "advertising {} as {}.{} on {}:{}",
            service.droplet, service.instance, self.service_type, service.ip, service.port
        );
        Ok(())
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        // Unregisters every advertised service.
        let _ = self.daemon.shutdown();
    }
}

/// Source of this machine's LAN address, injected so tests can pin it.
pub trait LocalAddr: Send + Sync {
    fn ipv4(&self) -> io::Result<Ipv4Addr>;
}

/// Ask the routing table which local address would reach the mDNS group.
/// `connect` on UDP sends nothing.
pub struct RoutedAddr;

impl LocalAddr for RoutedAddr {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(224, 0, 0, 251), 5353))?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no non-loopback IPv4 interface found",
            )),
        }
    }
}

pub struct FixedAddr(pub Ipv4Addr);

impl LocalAddr for FixedAddr {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        Ok(self.0)
    }
}
