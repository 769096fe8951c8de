//! Multicast socket construction and the seam the receive loop runs
//! against. Tests substitute [`SsdpSocket`] the way the rest of the crate
//! substitutes the HTTP client.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::Address;
use crate::net::InterfaceBinding;

/// Multicast TTL mandated for SSDP by UPnP 1.x.
const SSDP_TTL: u32 = 4;

/// Read timeout bounding cancellation latency of the receive loop.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// The socket operations the datagram server core needs.
pub(crate) trait SsdpSocket: Send + Sync {
    fn join_group(&self) -> io::Result<()>;
    fn leave_group(&self) -> io::Result<()>;
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// Blocks up to the configured read timeout; a timeout surfaces as
    /// `WouldBlock` or `TimedOut` depending on the platform.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// UDP socket bound for one (interface, mode) pair, with the outgoing
/// multicast interface and TTL already configured.
pub(crate) struct MulticastSocket {
    inner: UdpSocket,
    address: Address,
    binding: InterfaceBinding,
}

impl MulticastSocket {
    pub(crate) fn open(
        address: Address,
        binding: &InterfaceBinding,
        bind_port: u16,
    ) -> io::Result<Self> {
        let domain = match address {
            Address::IpV4 => Domain::IPV4,
            Address::IpV6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        match (address, binding.address()) {
            (Address::IpV4, IpAddr::V4(v4)) => {
                socket.set_multicast_if_v4(&v4)?;
                socket.set_multicast_ttl_v4(SSDP_TTL)?;
                let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), bind_port);
                socket.bind(&bind_addr.into())?;
            }
            (Address::IpV6, _) => {
                socket.set_multicast_if_v6(binding.interface_index())?;
                socket.set_multicast_hops_v6(SSDP_TTL)?;
                let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind_port);
                socket.bind(&bind_addr.into())?;
            }
            (Address::IpV4, IpAddr::V6(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "IPv4 mode bound to an IPv6 interface address",
                ));
            }
        }
        Ok(Self {
            inner: socket.into(),
            address,
            binding: binding.clone(),
        })
    }
}

impl SsdpSocket for MulticastSocket {
    fn join_group(&self) -> io::Result<()> {
        match (self.address, self.binding.address()) {
            (Address::IpV4, IpAddr::V4(v4)) => self
                .inner
                .join_multicast_v4(&super::SSDP_GROUP_V4, &v4),
            _ => self
                .inner
                .join_multicast_v6(&super::SSDP_GROUP_V6, self.binding.interface_index()),
        }
    }

    fn leave_group(&self) -> io::Result<()> {
        match (self.address, self.binding.address()) {
            (Address::IpV4, IpAddr::V4(v4)) => self
                .inner
                .leave_multicast_v4(&super::SSDP_GROUP_V4, &v4),
            _ => self
                .inner
                .leave_multicast_v6(&super::SSDP_GROUP_V6, self.binding.interface_index()),
        }
    }

    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(data, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }
}
