//! Network interface enumeration and subnet math for the SSDP layer.

use std::io;
use std::net::IpAddr;

use get_if_addrs::{get_if_addrs, IfAddr};

/// One address carried by a network interface, with its prefix length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// A network interface with all its non-loopback addresses grouped.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    name: String,
    index: u32,
    addresses: Vec<InterfaceAddress>,
}

impl NetworkInterface {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS interface index, 0 when it cannot be resolved.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn addresses(&self) -> &[InterfaceAddress] {
        &self.addresses
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, addresses: Vec<InterfaceAddress>) -> Self {
        Self {
            name: name.to_string(),
            index: 0,
            addresses,
        }
    }
}

/// The (interface, address, prefix) triple a datagram server binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    interface_name: String,
    interface_index: u32,
    address: IpAddr,
    prefix_len: u8,
}

impl InterfaceBinding {
    pub(crate) fn new(interface: &NetworkInterface, address: &InterfaceAddress) -> Self {
        Self {
            interface_name: interface.name.clone(),
            interface_index: interface.index,
            address: address.addr,
            prefix_len: address.prefix_len,
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn interface_index(&self) -> u32 {
        self.interface_index
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Address rendered without brackets or scope, for thread-name suffixes.
    pub fn simple_address_string(&self) -> String {
        self.address.to_string()
    }

    #[cfg(test)]
    pub(crate) fn for_test(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            interface_name: "test0".to_string(),
            interface_index: 0,
            address,
            prefix_len,
        }
    }
}

/// Enumerate non-loopback interfaces, grouping the per-address entries
/// returned by the OS by interface name.
pub fn network_interfaces() -> io::Result<Vec<NetworkInterface>> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for entry in get_if_addrs()? {
        if entry.is_loopback() {
            continue;
        }
        let address = InterfaceAddress {
            addr: entry.ip(),
            prefix_len: netmask_prefix_len(&entry.addr),
        };
        match interfaces.iter_mut().find(|i| i.name == entry.name) {
            Some(interface) => interface.addresses.push(address),
            None => interfaces.push(NetworkInterface {
                index: interface_index(&entry.name),
                name: entry.name,
                addresses: vec![address],
            }),
        }
    }
    Ok(interfaces)
}

fn netmask_prefix_len(addr: &IfAddr) -> u8 {
    match addr {
        IfAddr::V4(v4) => u32::from(v4.netmask).count_ones() as u8,
        IfAddr::V6(v6) => u128::from(v6.netmask).count_ones() as u8,
    }
}

/// True iff `a` and `b` agree on the first `prefix_len` bits.
///
/// Addresses of different families never share a segment.
pub fn same_segment(a: IpAddr, b: IpAddr, prefix_len: u8) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let diff = u32::from(a) ^ u32::from(b);
            match prefix_len {
                0 => true,
                1..=31 => diff >> (32 - u32::from(prefix_len)) == 0,
                _ => diff == 0,
            }
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let diff = u128::from(a) ^ u128::from(b);
            match prefix_len {
                0 => true,
                1..=127 => diff >> (128 - u32::from(prefix_len)) == 0,
                _ => diff == 0,
            }
        }
        _ => false,
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> u32 {
    let Ok(c_name) = std::ffi::CString::new(name) else {
        return 0;
    };
    // if_nametoindex only reads the name and returns 0 on failure.
    unsafe { libc::if_nametoindex(c_name.as_ptr()) }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> u32 {
    0
}
