//! Wire model for the aggregator stream, hand-written against the
//! `NetworkConnectionInfo` protobuf contract. Presence of
//! `close_timestamp` encodes an inactive (closed) entry.

use crate::net::{Address, Connection, ContainerEndpoint, Endpoint, Family, L4Proto};
use crate::tracker::{ConnMap, ConnStatus, EndpointMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AddressFamily {
    Unspecified = 0,
    V4 = 1,
    V6 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum L4Protocol {
    Unknown = 0,
    Tcp = 1,
    Udp = 2,
    Icmp = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionRole {
    Client = 0,
    Server = 1,
}

/// An address, a network, or a bare port. A network is encoded by a
/// prefix length narrower than the family width; a null address by an
/// unspecified family with empty bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkAddress {
    #[prost(enumeration = "AddressFamily", tag = "1")]
    pub family: i32,
    /// Address bytes in network order, family-width long.
    #[prost(bytes = "vec", tag = "2")]
    pub address_data: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub prefix_len: u32,
    #[prost(uint32, tag = "4")]
    pub port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkConnection {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(message, optional, tag = "2")]
    pub local: Option<NetworkAddress>,
    #[prost(message, optional, tag = "3")]
    pub remote: Option<NetworkAddress>,
    #[prost(enumeration = "L4Protocol", tag = "4")]
    pub protocol: i32,
    #[prost(enumeration = "ConnectionRole", tag = "5")]
    pub role: i32,
    #[prost(int64, optional, tag = "6")]
    pub close_timestamp: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkEndpoint {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(message, optional, tag = "2")]
    pub address: Option<NetworkAddress>,
    #[prost(enumeration = "L4Protocol", tag = "3")]
    pub protocol: i32,
    #[prost(int64, optional, tag = "4")]
    pub close_timestamp: Option<i64>,
}

/// One delta pushed over the `PushNetworkConnectionInfo` stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkConnectionInfoMessage {
    #[prost(message, repeated, tag = "1")]
    pub updated_connections: Vec<NetworkConnection>,
    #[prost(message, repeated, tag = "2")]
    pub updated_endpoints: Vec<NetworkEndpoint>,
    #[prost(int64, tag = "3")]
    pub time: i64,
}

/// Known-CIDR update: each field is a concatenation of fixed-width
/// `(address bytes, prefix byte)` records, 5 bytes per IPv4 network and
/// 17 per IPv6.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpNetworksUpdate {
    #[prost(bytes = "bytes", tag = "1")]
    pub ipv4_networks: ::prost::bytes::Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub ipv6_networks: ::prost::bytes::Bytes,
}

/// Known-public-IP update; replaces the previous set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicIpsUpdate {
    #[prost(message, repeated, tag = "1")]
    pub addresses: Vec<NetworkAddress>,
}

/// Builds the outbound message for one pair of deltas.
pub fn info_message(
    conn_delta: &ConnMap,
    endpoint_delta: &EndpointMap,
    time_micros: i64,
) -> NetworkConnectionInfoMessage {
    NetworkConnectionInfoMessage {
        updated_connections: conn_delta
            .iter()
            .map(|(conn, status)| connection_proto(conn, status))
            .collect(),
        updated_endpoints: endpoint_delta
            .iter()
            .map(|(ep, status)| endpoint_proto(ep, status))
            .collect(),
        time: time_micros,
    }
}

fn connection_proto(conn: &Connection, status: &ConnStatus) -> NetworkConnection {
    NetworkConnection {
        container_id: conn.container.to_string(),
        local: address_proto(&conn.local),
        remote: address_proto(&conn.remote),
        protocol: protocol_proto(conn.protocol) as i32,
        role: if conn.is_server {
            ConnectionRole::Server
        } else {
            ConnectionRole::Client
        } as i32,
        close_timestamp: close_timestamp(status),
    }
}

fn endpoint_proto(ep: &ContainerEndpoint, status: &ConnStatus) -> NetworkEndpoint {
    NetworkEndpoint {
        container_id: ep.container.to_string(),
        address: address_proto(&ep.endpoint),
        protocol: protocol_proto(ep.protocol) as i32,
        close_timestamp: close_timestamp(status),
    }
}

fn close_timestamp(status: &ConnStatus) -> Option<i64> {
    (!status.is_active()).then(|| status.last_active_micros())
}

fn protocol_proto(proto: L4Proto) -> L4Protocol {
    match proto {
        L4Proto::Tcp => L4Protocol::Tcp,
        L4Proto::Udp => L4Protocol::Udp,
        L4Proto::Icmp => L4Protocol::Icmp,
        L4Proto::Unknown => L4Protocol::Unknown,
    }
}

fn address_proto(endpoint: &Endpoint) -> Option<NetworkAddress> {
    if endpoint.is_null() {
        return None;
    }
    let net = endpoint.network();
    Some(NetworkAddress {
        family: match net.family() {
            Family::V4 => AddressFamily::V4,
            Family::V6 => AddressFamily::V6,
            Family::Unknown => AddressFamily::Unspecified,
        } as i32,
        address_data: net.address().bytes().to_vec(),
        prefix_len: u32::from(net.bits()),
        port: u32::from(endpoint.port()),
    })
}

/// Decodes an address from a control message. `None` for families or
/// byte widths this agent does not understand.
pub fn address_from_proto(addr: &NetworkAddress) -> Option<Address> {
    let family = match AddressFamily::try_from(addr.family).ok()? {
        AddressFamily::V4 => Family::V4,
        AddressFamily::V6 => Family::V6,
        AddressFamily::Unspecified => return None,
    };
    Address::from_bytes(family, &addr.address_data)
}
