//! Broadcast target resolution.
//!
//! Pure functions over a [`Topology`] snapshot; no radio access.

use std::net::Ipv4Addr;

/// Fixed address of the access point on its /24.
pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
pub const AP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const AP_BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 255);

/// Which interfaces are currently usable, with their assigned addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Topology {
    pub access_point: Option<Ipv4Addr>,
    /// Only set while the station is connected and holds an address.
    pub station: Option<Ipv4Addr>,
}

impl Topology {
    pub fn ap_only() -> Self {
        Self {
            access_point: Some(AP_ADDRESS),
            station: None,
        }
    }

    pub fn dual(station: Ipv4Addr) -> Self {
        Self {
            access_point: Some(AP_ADDRESS),
            station: Some(station),
        }
    }
}

/// Broadcast address of the /24 containing `addr`.
pub fn broadcast_of(addr: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = addr.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Parses an explicit target override. Blank or unparsable means "no override".
pub fn parse_override(target: &str) -> Option<Ipv4Addr> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    target.parse().ok()
}

/// Resolves where a trigger message has to go.
///
/// A valid override wins outright. Otherwise the station broadcast comes
/// first, then the access point broadcast. The result is never empty.
pub fn resolve(target_override: &str, topology: &Topology) -> Vec<Ipv4Addr> {
    if let Some(ip) = parse_override(target_override) {
        return vec![ip];
    }

    let mut addresses = Vec::with_capacity(2);
    if let Some(station) = topology.station {
        addresses.push(broadcast_of(station));
    }
    if let Some(ap) = topology.access_point {
        let ap_broadcast = broadcast_of(ap);
        if !addresses.contains(&ap_broadcast) {
            addresses.push(ap_broadcast);
        }
    }

    if addresses.is_empty() {
        addresses.push(AP_BROADCAST);
    }
    addresses
}
