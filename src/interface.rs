//! Mapping a local IP address to the network interface that owns it.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use nix::ifaddrs::{getifaddrs, InterfaceAddress};
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use nix::sys::socket::SockaddrStorage;
use serde::Serialize;

/// Interface lookup failure. Never fatal to a knock.
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("failed to enumerate interfaces: {0}")]
    Enumerate(#[from] nix::Error),

    #[error("no interface owns address {0}")]
    NotFound(IpAddr),
}

/// An address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddr {
    pub ip: IpAddr,
    pub prefix_len: Option<u8>,
}

/// A network interface and all of its addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    /// MAC address as `aa:bb:cc:dd:ee:ff`, when the interface has one.
    pub hardware_addr: Option<String>,
    pub addrs: Vec<InterfaceAddr>,
    pub up: bool,
    pub loopback: bool,
    pub running: bool,
    pub multicast: bool,
    pub broadcast: bool,
    pub point_to_point: bool,
}

impl NetInterface {
    fn new(name: &str, flags: InterfaceFlags) -> Self {
        Self {
            name: name.to_string(),
            index: if_nametoindex(name).unwrap_or(0),
            hardware_addr: None,
            addrs: Vec::new(),
            up: flags.contains(InterfaceFlags::IFF_UP),
            loopback: flags.contains(InterfaceFlags::IFF_LOOPBACK),
            running: flags.contains(InterfaceFlags::IFF_RUNNING),
            multicast: flags.contains(InterfaceFlags::IFF_MULTICAST),
            broadcast: flags.contains(InterfaceFlags::IFF_BROADCAST),
            point_to_point: flags.contains(InterfaceFlags::IFF_POINTOPOINT),
        }
    }

    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.addrs.iter().any(|a| a.ip == ip)
    }
}

/// Finds the interface owning a local IP address.
pub trait InterfaceResolver: Send + Sync {
    fn query(&self, ip: IpAddr) -> Result<NetInterface, InterfaceError>;
}

/// Resolver backed by the operating system's interface table (`getifaddrs`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl SystemInterfaces {
    /// All interfaces, ordered by name.
    pub fn list(&self) -> Result<Vec<NetInterface>, InterfaceError> {
        let mut by_name: BTreeMap<String, NetInterface> = BTreeMap::new();
        for entry in getifaddrs()? {
            let iface = by_name
                .entry(entry.interface_name.clone())
                .or_insert_with(|| NetInterface::new(&entry.interface_name, entry.flags));
            absorb(iface, &entry);
        }
        Ok(by_name.into_values().collect())
    }
}

impl InterfaceResolver for SystemInterfaces {
    fn query(&self, ip: IpAddr) -> Result<NetInterface, InterfaceError> {
        // IPv4-mapped IPv6 sockets report ::ffff:a.b.c.d; interfaces list a.b.c.d.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.list()?
            .into_iter()
            .find(|iface| iface.has_ip(ip))
            .ok_or(InterfaceError::NotFound(ip))
    }
}

fn absorb(iface: &mut NetInterface, entry: &InterfaceAddress) {
    let Some(address) = entry.address.as_ref() else {
        return;
    };
    if let Some(link) = address.as_link_addr() {
        if let Some(mac) = link.addr().filter(|m| m.iter().any(|b| *b != 0)) {
            iface.hardware_addr = Some(format_mac(&mac));
        }
        return;
    }
    if let Some(ip) = ip_of(address) {
        let prefix_len = entry.netmask.as_ref().and_then(ip_of).map(prefix_len);
        iface.addrs.push(InterfaceAddr { ip, prefix_len });
    }
}

fn ip_of(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Some(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
    }
    None
}

fn prefix_len(mask: IpAddr) -> u8 {
    let ones = match mask {
        IpAddr::V4(m) => u32::from(m).count_ones(),
        IpAddr::V6(m) => u128::from(m).count_ones(),
    };
    ones as u8
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
