//! Value types for addresses, CIDR networks, endpoints, and connections,
//! plus the radix tree used for longest-prefix-match CIDR lookups.

pub mod address;
pub mod conn;
pub mod endpoint;
pub mod network;
pub mod parse;
pub mod radix;

pub use address::{Address, Family};
pub use conn::{Connection, ContainerEndpoint, ContainerId, L4Proto};
pub use endpoint::{is_ephemeral, Endpoint};
pub use network::IpNetwork;
pub use parse::{parse_address_list, HostPort};
pub use radix::NetworkTree;
