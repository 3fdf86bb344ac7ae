//! Default device-id discovery.
//!
//! The protocol identifies devices by the MAC of their preferred physical
//! interface. "Preferred" is approximated with a routing probe: dial a UDP
//! socket at a public address (nothing is sent), read the local endpoint the
//! OS picked, and take the first non-loopback, non-virtual interface that
//! owns that address. Selection is a pure function so tests inject the probe
//! address and interface list.

use std::net::IpAddr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use tracing::debug;

const PROBE_TARGET: &str = "8.8.8.8:80";

/// Name fragments that mark an interface as virtual.
const VIRTUAL_MARKERS: &[&str] = &[
    "virtual", "vmware", "hyper-v", "vethernet", "vbox", "docker", "br-", "loopback", "npcap",
    "tailscale", "utun", "tap", "tun",
];

#[derive(Debug, Clone)]
pub struct IfaceInfo {
    pub name: String,
    pub mac: Option<String>,
    pub addrs: Vec<IpAddr>,
}

pub fn is_virtual_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIRTUAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn usable_mac(mac: &str) -> bool {
    !mac.is_empty() && mac.bytes().any(|b| b != b'0' && b != b':' && b != b'-')
}

/// Picks the device id for a given probe result: the lowercased MAC of the
/// first non-loopback, non-virtual interface owning `probe_addr`.
pub fn select_device_id(probe_addr: IpAddr, interfaces: &[IfaceInfo]) -> Option<String> {
    interfaces
        .iter()
        .filter(|iface| !is_virtual_name(&iface.name))
        .filter(|iface| iface.addrs.iter().any(|a| *a == probe_addr && !a.is_loopback()))
        .find_map(|iface| {
            iface
                .mac
                .as_deref()
                .filter(|mac| usable_mac(mac))
                .map(|mac| mac.to_lowercase())
        })
}

/// Local address the OS routes public traffic through. No packet is sent.
pub fn probe_local_addr() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(PROBE_TARGET).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn system_interfaces() -> Vec<IfaceInfo> {
    match NetworkInterface::show() {
        Ok(list) => list
            .into_iter()
            .map(|iface| IfaceInfo {
                name: iface.name,
                mac: iface.mac_addr,
                addrs: iface
                    .addr
                    .iter()
                    .map(|addr| match addr {
                        Addr::V4(v4) => IpAddr::V4(v4.ip),
                        Addr::V6(v6) => IpAddr::V6(v6.ip),
                    })
                    .collect(),
            })
            .collect(),
        Err(err) => {
            debug!(error = %err, "interface enumeration failed");
            Vec::new()
        }
    }
}

/// System wrapper over [`select_device_id`]. `None` when the host has no
/// route out or no physical interface matched.
pub fn default_device_id() -> Option<String> {
    let probe = probe_local_addr()?;
    select_device_id(probe, &system_interfaces())
}
