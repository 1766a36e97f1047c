use std::fmt;

use crate::net::address::{Address, Family};
use crate::net::network::IpNetwork;

/// A network endpoint: an [`IpNetwork`] plus a 16-bit port.
///
/// A host-width network with a nonzero port denotes a concrete
/// address:port pair; a narrower network denotes "any address in this
/// net, this port". The null endpoint (null network, port 0) stands for
/// an erased side of a normalized connection.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Endpoint {
    network: IpNetwork,
    port: u16,
}

impl Endpoint {
    pub fn new(address: Address, port: u16) -> Self {
        Self { network: IpNetwork::host(address), port }
    }

    pub fn from_network(network: IpNetwork, port: u16) -> Self {
        Self { network, port }
    }

    /// The null endpoint.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn network(&self) -> &IpNetwork {
        &self.network
    }

    pub fn address(&self) -> &Address {
        self.network.address()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_null(&self) -> bool {
        self.network.is_null() && self.port == 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network.family() == Family::V6 {
            write!(f, "[{}]:{}", self.network, self.port)
        } else {
            write!(f, "{}:{}", self.network, self.port)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Confidence that a port was ephemerally assigned, from 0 (not an
/// ephemeral range) to 4 (IANA dynamic range). Used as a heuristic for
/// client/server role inference.
pub fn is_ephemeral(port: u16) -> u8 {
    match port {
        49152..=u16::MAX => 4, // IANA dynamic range
        32768..=49151 => 3,    // modern Linux default
        1025..=5000 => 2,      // legacy BSD/Windows
        1024 => 1,
        _ => 0,
    }
}
