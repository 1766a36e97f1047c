use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use crate::net::network::IpNetwork;

/// Address family of an [`Address`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    #[default]
    Unknown,
    V4,
    V6,
}

impl Family {
    /// Length of an address of this family, in bytes.
    pub fn byte_len(self) -> usize {
        match self {
            Family::Unknown => 0,
            Family::V4 => 4,
            Family::V6 => 16,
        }
    }

    /// Length of an address of this family, in bits.
    pub fn bit_len(self) -> u8 {
        (self.byte_len() * 8) as u8
    }
}

/// Maximum address length in bytes (IPv6).
pub const ADDR_MAX_LEN: usize = 16;

/// An IPv4 or IPv6 address.
///
/// The bytes are stored in network order in a fixed 16-byte buffer; IPv4
/// addresses occupy the leading 4 bytes. An all-zero buffer with family
/// `Unknown` is the null address used by normalized connection tuples.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address {
    family: Family,
    data: [u8; ADDR_MAX_LEN],
}

impl Address {
    /// The all-zero address of the given family (0.0.0.0 / ::).
    pub fn any(family: Family) -> Self {
        Self { family, data: [0u8; ADDR_MAX_LEN] }
    }

    /// The all-ones address of the given family. Used as the sentinel for
    /// "some unknown public host" in normalized connections.
    pub fn all_ones(family: Family) -> Self {
        let mut data = [0u8; ADDR_MAX_LEN];
        for b in data.iter_mut().take(family.byte_len()) {
            *b = 0xff;
        }
        Self { family, data }
    }

    /// Builds an address from network-order bytes. Returns `None` if the
    /// slice length does not match the family width.
    pub fn from_bytes(family: Family, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != family.byte_len() {
            return None;
        }
        let mut data = [0u8; ADDR_MAX_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self { family, data })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// The significant bytes of this address, in network order.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.family.byte_len()]
    }

    /// True if every byte of the buffer is zero, regardless of family.
    /// Note this holds for 0.0.0.0 and :: as well as for the null address.
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// The IPv6 form of this address; IPv4 addresses map to
    /// ::ffff:0:0/96. Null for unknown-family addresses.
    pub fn to_v6(&self) -> Address {
        match self.family {
            Family::V6 => *self,
            Family::V4 => {
                let mut data = [0u8; ADDR_MAX_LEN];
                data[10] = 0xff;
                data[11] = 0xff;
                data[12..16].copy_from_slice(&self.data[..4]);
                Address { family: Family::V6, data }
            }
            Family::Unknown => Address::default(),
        }
    }

    /// True for loopback addresses: 127.0.0.0/8, ::1, and the IPv4-mapped
    /// ::ffff:127.0.0.0/104 range.
    pub fn is_local(&self) -> bool {
        match self.family {
            Family::V4 => self.data[0] == 127,
            Family::V6 => {
                if self.data[..10].iter().any(|&b| b != 0) {
                    return false;
                }
                if self.data[10..15] == [0, 0, 0, 0, 0] && self.data[15] == 1 {
                    return true;
                }
                self.data[10] == 0xff && self.data[11] == 0xff && self.data[12] == 127
            }
            Family::Unknown => false,
        }
    }

    /// True unless the address falls into one of the well-known private
    /// ranges (RFC1918, 100.64/10, 169.254/16, fd00::/8) or their
    /// IPv4-mapped equivalents. Addresses with a zero leading u64 that are
    /// not IPv4-mapped (::1 among them) are never public.
    pub fn is_public(&self) -> bool {
        match self.family {
            Family::V4 => !private_v4_networks().iter().any(|net| net.contains(self)),
            Family::V6 => {
                if self.data[..8].iter().all(|&b| b == 0) {
                    if self.data[8..10] == [0, 0] && self.data[10] == 0xff && self.data[11] == 0xff
                    {
                        let mapped = match Address::from_bytes(Family::V4, &self.data[12..16]) {
                            Some(addr) => addr,
                            None => return false,
                        };
                        return mapped.is_public();
                    }
                    return false;
                }
                self.data[0] != 0xfd
            }
            Family::Unknown => false,
        }
    }

    /// The `std::net` view of this address, if it has a known family.
    pub fn as_ip_addr(&self) -> Option<IpAddr> {
        match self.family {
            Family::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.data[..4]);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            Family::V6 => Some(IpAddr::V6(Ipv6Addr::from(self.data))),
            Family::Unknown => None,
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        let mut data = [0u8; ADDR_MAX_LEN];
        data[..4].copy_from_slice(&addr.octets());
        Self { family: Family::V4, data }
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Self { family: Family::V6, data: addr.octets() }
    }
}

impl From<IpAddr> for Address {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<[u8; 4]> for Address {
    fn from(octets: [u8; 4]) -> Self {
        Ipv4Addr::from(octets).into()
    }
}

impl From<[u8; 16]> for Address {
    fn from(octets: [u8; 16]) -> Self {
        Ipv6Addr::from(octets).into()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ip_addr() {
            Some(ip) => write!(f, "{ip}"),
            None => write!(f, "<unknown>"),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

fn private_v4_networks() -> &'static [IpNetwork] {
    static NETS: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    NETS.get_or_init(|| {
        vec![
            IpNetwork::new(Address::from([10, 0, 0, 0]), 8),
            IpNetwork::new(Address::from([172, 16, 0, 0]), 12),
            IpNetwork::new(Address::from([192, 168, 0, 0]), 16),
            IpNetwork::new(Address::from([100, 64, 0, 0]), 10),
            IpNetwork::new(Address::from([169, 254, 0, 0]), 16),
        ]
    })
}
