use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::net::address::{Address, Family, ADDR_MAX_LEN};

/// A CIDR network: an address plus a prefix length in bits.
///
/// Stored networks always have their host bits cleared. The `is_addr` flag
/// distinguishes a single-host address (prefix == family width) from a true
/// network of the same width.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    address: Address,
    bits: u8,
    is_addr: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid CIDR network: {0}")]
pub struct InvalidNetwork(pub String);

impl IpNetwork {
    /// Builds a network from an address and prefix length. The prefix is
    /// clamped to the family width and host bits are cleared.
    pub fn new(address: Address, bits: u8) -> Self {
        Self::build(address, bits, false)
    }

    /// Builds the single-host network of `address` (prefix == family width).
    pub fn host(address: Address) -> Self {
        Self::build(address, address.family().bit_len(), true)
    }

    fn build(address: Address, bits: u8, is_addr: bool) -> Self {
        let family = address.family();
        let bits = bits.min(family.bit_len());
        let len = family.byte_len();

        let mut data = [0u8; ADDR_MAX_LEN];
        data[..len].copy_from_slice(address.bytes());

        let full = bits as usize / 8;
        let rem = bits as usize % 8;
        if rem != 0 {
            data[full] &= !(0xffu8 >> rem);
        }
        let first_host_byte = full + usize::from(rem != 0);
        for b in data.iter_mut().take(len).skip(first_host_byte) {
            *b = 0;
        }

        let address = Address::from_bytes(family, &data[..len]).unwrap_or_default();
        Self { address, bits, is_addr }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn family(&self) -> Family {
        self.address.family()
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// True if this denotes a concrete single-host address rather than a
    /// network.
    pub fn is_addr(&self) -> bool {
        self.is_addr
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    /// CIDR containment: `addr` belongs to this network iff its leading
    /// `bits` bits equal the network's. Always false across families.
    pub fn contains(&self, addr: &Address) -> bool {
        if self.family() != addr.family() {
            return false;
        }
        let bits = self.bits as usize;
        let net = self.address.bytes();
        let other = addr.bytes();

        let full = bits / 8;
        if net[..full] != other[..full] {
            return false;
        }
        let rem = bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = !(0xffu8 >> rem);
        (net[full] & mask) == (other[full] & mask)
    }
}

impl From<Address> for IpNetwork {
    fn from(address: Address) -> Self {
        IpNetwork::host(address)
    }
}

impl FromStr for IpNetwork {
    type Err = InvalidNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            let net: ipnet::IpNet = s.parse().map_err(|_| InvalidNetwork(s.to_string()))?;
            Ok(IpNetwork::new(Address::from(net.addr()), net.prefix_len()))
        } else {
            let addr: IpAddr = s.parse().map_err(|_| InvalidNetwork(s.to_string()))?;
            Ok(IpNetwork::host(Address::from(addr)))
        }
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_addr {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{}/{}", self.address, self.bits)
        }
    }
}

impl fmt::Debug for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_bits_are_cleared() {
        let net: IpNetwork = "139.45.27.4/16".parse().unwrap();
        assert_eq!(net.to_string(), "139.45.0.0/16");
        assert_eq!(net.bits(), 16);
        assert!(!net.is_addr());
    }

    #[test]
    fn parse_format_is_canonical() {
        for (input, canonical) in [
            ("10.0.0.0/8", "10.0.0.0/8"),
            ("10.1.2.3/8", "10.0.0.0/8"),
            ("192.168.17.1/28", "192.168.17.0/28"),
            ("2001:db8::dead:beef/32", "2001:db8::/32"),
            ("8.8.8.8", "8.8.8.8"),
        ] {
            let net: IpNetwork = input.parse().unwrap();
            assert_eq!(net.to_string(), canonical, "input {input}");
        }
        assert!("not-a-net/8".parse::<IpNetwork>().is_err());
        assert!("10.0.0.0/".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn contains_masks_straddling_byte() {
        let net: IpNetwork = "172.16.0.0/12".parse().unwrap();
        assert!(net.contains(&Address::from([172, 16, 0, 1])));
        assert!(net.contains(&Address::from([172, 31, 255, 255])));
        assert!(!net.contains(&Address::from([172, 32, 0, 1])));
    }

    #[test]
    fn contains_is_false_across_families() {
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let mapped = Address::from([10, 1, 2, 3]).to_v6();
        assert!(!net.contains(&mapped));

        let v6net: IpNetwork = "::ffff:10.0.0.0/104".parse().unwrap();
        assert!(v6net.contains(&mapped));
    }

    #[test]
    fn to_v6_containment_round_trip() {
        for octets in [[1, 2, 3, 4], [127, 0, 0, 1], [255, 255, 255, 255]] {
            let addr = Address::from(octets);
            let net = IpNetwork::host(addr.to_v6());
            assert!(net.contains(&addr.to_v6()));
        }
    }

    #[test]
    fn prefix_clamps_to_family_width() {
        let net = IpNetwork::new(Address::from([10, 0, 0, 1]), 64);
        assert_eq!(net.bits(), 32);
        assert!(net.contains(&Address::from([10, 0, 0, 1])));
        assert!(!net.contains(&Address::from([10, 0, 0, 2])));
    }
}
