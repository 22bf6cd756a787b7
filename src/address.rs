// src/address.rs
use std::net::{IpAddr, Ipv4Addr};

use get_if_addrs::get_if_addrs;
use log::{debug, warn};

use crate::error::PairError;

/// Where the receiver's LAN address comes from.
pub trait AddressSource: Send + Sync {
    fn lan_ipv4(&self) -> Option<Ipv4Addr>;
}

/// Reads the host's network interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceAddresses;

impl AddressSource for InterfaceAddresses {
    fn lan_ipv4(&self) -> Option<Ipv4Addr> {
        let ifaces = match get_if_addrs() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                warn!("interface enumeration failed: {e}");
                return None;
            }
        };

        let picked = pick_lan_ipv4(ifaces.iter().map(|iface| iface.ip()));
        debug!("LAN address candidates: {}, picked {picked:?}", ifaces.len());
        picked
    }
}

/// A known address, e.g. one supplied by the platform layer.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddress(pub Ipv4Addr);

impl AddressSource for FixedAddress {
    fn lan_ipv4(&self) -> Option<Ipv4Addr> {
        Some(self.0)
    }
}

/// No network: always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAddress;

impl AddressSource for NoAddress {
    fn lan_ipv4(&self) -> Option<Ipv4Addr> {
        None
    }
}

/// First IPv4 address a peer on the LAN could reach.
pub fn pick_lan_ipv4<I>(addrs: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs.into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() && !v4.is_link_local() => Some(v4),
        _ => None,
    })
}

pub fn resolve_lan_address(source: &dyn AddressSource) -> Result<Ipv4Addr, PairError> {
    source.lan_ipv4().ok_or(PairError::AddressUnavailable)
}
