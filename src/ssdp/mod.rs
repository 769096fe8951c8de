//! SSDP (Simple Service Discovery Protocol) — the UDP multicast discovery
//! layer of UPnP, seen from the control-point side.
//!
//! - [`SsdpNotifyReceiver`]: joins the group on port 1900 and surfaces
//!   alive/byebye/update announcements
//! - [`SsdpSearchServer`]: sends M-SEARCH from an ephemeral port and surfaces
//!   the unicast responses
//! - [`SsdpMessage`]: the HTTP-shaped datagram payload
//!
//! Multicast groups: 239.255.255.250:1900 (IPv4) and [FF02::C]:1900
//! (IPv6 link-local), TTL 4.

mod message;
mod notify_receiver;
mod search_server;
mod server;
mod socket;

pub use message::SsdpMessage;
pub use notify_receiver::{SsdpNotifyEvent, SsdpNotifyReceiver};
pub use search_server::SsdpSearchServer;
pub use server::{is_invalid_location, Receiver, SsdpServer};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::errors::UpnpError;
use crate::net::{InterfaceBinding, NetworkInterface};

/// SSDP port, for both multicast groups and M-SEARCH targets.
pub const SSDP_PORT: u16 = 1900;

/// IPv4 multicast group.
pub const SSDP_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// IPv6 link-local multicast group.
pub const SSDP_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// Announcement validity when CACHE-CONTROL carries no usable max-age.
pub const DEFAULT_MAX_AGE: u32 = 1800;

pub const NTS_ALIVE: &str = "ssdp:alive";
pub const NTS_BYEBYE: &str = "ssdp:byebye";
pub const NTS_UPDATE: &str = "ssdp:update";

/// Search target matching every device and service.
pub const ST_ALL: &str = "ssdp:all";

/// Search target matching root devices only.
pub const ST_ROOT_DEVICE: &str = "upnp:rootdevice";

/// Address family mode of an SSDP server. IPv6 operation is link-local only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    IpV4,
    IpV6,
}

impl Address {
    pub fn multicast_address(self) -> IpAddr {
        match self {
            Address::IpV4 => IpAddr::V4(SSDP_GROUP_V4),
            Address::IpV6 => IpAddr::V6(SSDP_GROUP_V6),
        }
    }

    pub fn socket_address(self) -> SocketAddr {
        SocketAddr::new(self.multicast_address(), SSDP_PORT)
    }

    /// Display form used in HOST headers.
    pub fn address_string(self) -> &'static str {
        match self {
            Address::IpV4 => "239.255.255.250:1900",
            Address::IpV6 => "[FF02::C]:1900",
        }
    }

    /// Pick the interface address matching this mode: the first IPv4
    /// address, or the first link-local IPv6 address. Non-link-local IPv6
    /// addresses are ignored.
    pub fn find_interface_address(
        self,
        interface: &NetworkInterface,
    ) -> Result<InterfaceBinding, UpnpError> {
        let found = interface.addresses().iter().find(|a| match (self, a.addr) {
            (Address::IpV4, IpAddr::V4(_)) => true,
            (Address::IpV6, IpAddr::V6(v6)) => is_link_local_v6(&v6),
            _ => false,
        });
        match found {
            Some(address) => Ok(InterfaceBinding::new(interface, address)),
            None => Err(UpnpError::NoSuitableAddress {
                interface: interface.name().to_string(),
                family: match self {
                    Address::IpV4 => "IPv4",
                    Address::IpV6 => "link-local IPv6",
                },
            }),
        }
    }
}

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}
