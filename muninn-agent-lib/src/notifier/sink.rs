//! The narrow boundary between the notifier and the RPC runtime: a
//! client that opens streams, a sink half for outbound deltas, and the
//! control messages flowing the other way.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::{Address, Family, IpNetwork};
use crate::notifier::proto::{IpNetworksUpdate, NetworkConnectionInfoMessage, PublicIpsUpdate};
use crate::notifier::NotifyError;

/// A control message received from the aggregator.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    KnownNetworks(IpNetworksUpdate),
    PublicIps(PublicIpsUpdate),
}

/// The outbound half of one open stream session.
#[async_trait]
pub trait ConnectionInfoStream: Send {
    async fn send(&mut self, msg: NetworkConnectionInfoMessage) -> Result<(), NotifyError>;
}

/// Both halves of one open stream session. Dropping the handles tears the
/// session down.
pub struct StreamHandles {
    pub stream: Box<dyn ConnectionInfoStream>,
    pub control: mpsc::Receiver<ControlMessage>,
}

/// Factory for stream sessions toward the aggregator. The production
/// implementation wraps the RPC channel; tests inject fakes.
#[async_trait]
pub trait ConnectionInfoClient: Send + Sync {
    /// Waits for the channel to become ready, racing the stop signal.
    /// False means "not ready, back off" (or stopped).
    async fn ready(&self, stop: &CancellationToken) -> bool;

    async fn open_stream(&self) -> Result<StreamHandles, NotifyError>;
}

/// Parses a concatenation of fixed-width `(address bytes, prefix byte)`
/// records, 5 bytes per IPv4 entry and 17 per IPv6. Any malformed record
/// fails the whole payload, so a table swap is all-or-nothing.
pub fn parse_network_records(data: &[u8], family: Family) -> Result<Vec<IpNetwork>, NotifyError> {
    let record_len = family.byte_len() + 1;
    if data.len() % record_len != 0 {
        return Err(NotifyError::MalformedNetworks(format!(
            "{} payload length {} is not a multiple of {record_len}",
            family_name(family),
            data.len(),
        )));
    }

    let width = family.bit_len();
    let mut networks = Vec::with_capacity(data.len() / record_len);
    for record in data.chunks_exact(record_len) {
        let (addr_bytes, prefix) = record.split_at(record_len - 1);
        let prefix = prefix[0];
        if prefix == 0 || prefix > width {
            return Err(NotifyError::MalformedNetworks(format!(
                "invalid prefix length {prefix} for {}",
                family_name(family),
            )));
        }
        let Some(address) = Address::from_bytes(family, addr_bytes) else {
            return Err(NotifyError::MalformedNetworks("bad address width".to_string()));
        };
        networks.push(IpNetwork::new(address, prefix));
    }
    Ok(networks)
}

fn family_name(family: Family) -> &'static str {
    match family {
        Family::V4 => "ipv4",
        Family::V6 => "ipv6",
        Family::Unknown => "unknown-family",
    }
}
