//! Concrete framed-TCP stream session implementing the sink traits.
//!
//! Outbound frames are a 4-byte big-endian length followed by a
//! prost-encoded [`NetworkConnectionInfoMessage`]. Inbound control frames
//! carry a 1-byte kind tag (1 = known networks, 2 = public IPs) before the
//! length. The RPC channel of a full deployment replaces this transport
//! behind the same traits.

use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::HostPort;
use crate::notifier::proto::{IpNetworksUpdate, NetworkConnectionInfoMessage, PublicIpsUpdate};
use crate::notifier::sink::{ConnectionInfoClient, ConnectionInfoStream, ControlMessage, StreamHandles};
use crate::notifier::NotifyError;
use crate::runtime::{check_connectivity, ProbeOutcome};

const FRAME_KIND_NETWORKS: u8 = 1;
const FRAME_KIND_PUBLIC_IPS: u8 = 2;

/// Upper bound on a single control frame; anything larger indicates a
/// desynchronized or hostile peer.
const MAX_FRAME_LEN: u32 = 16 << 20;

/// Buffered control messages between the reader task and the notifier
/// loop. Intentionally small: control updates are rare and idempotent.
const CONTROL_CHANNEL_DEPTH: usize = 8;

pub struct FramedTcpClient {
    target: HostPort,
    probe_timeout: Duration,
}

impl FramedTcpClient {
    pub fn new(target: HostPort, probe_timeout: Duration) -> Self {
        Self { target, probe_timeout }
    }
}

#[async_trait]
impl ConnectionInfoClient for FramedTcpClient {
    async fn ready(&self, stop: &CancellationToken) -> bool {
        matches!(
            check_connectivity(&self.target, self.probe_timeout, stop).await,
            ProbeOutcome::Reachable
        )
    }

    async fn open_stream(&self) -> Result<StreamHandles, NotifyError> {
        let stream = TcpStream::connect((self.target.host.as_str(), self.target.port)).await?;
        let (reader, writer) = stream.into_split();

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_DEPTH);
        tokio::spawn(read_control_frames(reader, control_tx));

        Ok(StreamHandles {
            stream: Box::new(FramedSink { writer }),
            control: control_rx,
        })
    }
}

struct FramedSink<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ConnectionInfoStream for FramedSink<W> {
    async fn send(&mut self, msg: NetworkConnectionInfoMessage) -> Result<(), NotifyError> {
        let payload = msg.encode_to_vec();
        self.writer.write_u32(payload.len() as u32).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reads tagged control frames until EOF, a framing error, or the
/// receiver going away. Dropping the sender closes the control channel,
/// which the notifier treats as a lost stream.
async fn read_control_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    control_tx: mpsc::Sender<ControlMessage>,
) {
    loop {
        let kind = match reader.read_u8().await {
            Ok(kind) => kind,
            Err(err) => {
                debug!(error = %err, "control stream closed");
                return;
            }
        };
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(err) => {
                debug!(error = %err, "control stream closed mid-frame");
                return;
            }
        };
        if len > MAX_FRAME_LEN {
            warn!(len, "oversized control frame; dropping stream");
            return;
        }
        let mut payload = vec![0u8; len as usize];
        if let Err(err) = reader.read_exact(&mut payload).await {
            debug!(error = %err, "control stream closed mid-payload");
            return;
        }

        let msg = match kind {
            FRAME_KIND_NETWORKS => IpNetworksUpdate::decode(payload.as_slice())
                .map(ControlMessage::KnownNetworks),
            FRAME_KIND_PUBLIC_IPS => PublicIpsUpdate::decode(payload.as_slice())
                .map(ControlMessage::PublicIps),
            other => {
                warn!(kind = other, "unknown control frame kind; dropping stream");
                return;
            }
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "undecodable control frame; dropping stream");
                return;
            }
        };
        if control_tx.send(msg).await.is_err() {
            return; // session torn down
        }
    }
}
