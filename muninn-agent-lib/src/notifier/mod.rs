//! The long-lived streaming session with the aggregator: drives the
//! scrape/track loop, publishes deltas, and feeds control messages
//! (known CIDRs, public-IP sets) back into the tracker.

pub mod proto;
pub mod sink;
pub mod transport;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::{Address, Family, NetworkTree};
use crate::notifier::proto::{IpNetworksUpdate, PublicIpsUpdate};
use crate::notifier::sink::{
    parse_network_records, ConnectionInfoClient, ConnectionInfoStream, ControlMessage,
    StreamHandles,
};
use crate::runtime::{now_micros, pause};
use crate::scraper::Scraper;
use crate::tracker::{ConnMap, ConnectionTracker, EndpointMap};

/// Delay before reconnecting after a failed or lost stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("stream I/O: {0}")]
    Io(#[from] io::Error),
    #[error("malformed networks payload: {0}")]
    MalformedNetworks(String),
}

/// Drives the periodic scrape → track → delta → send loop over one
/// stream session at a time, reconnecting with a fixed backoff. The
/// last-sent state snapshots survive reconnects, so the first delta on a
/// fresh stream is computed against the aggregator's last known view.
pub struct NetworkStatusNotifier<C> {
    client: C,
    scraper: Arc<dyn Scraper>,
    tracker: Arc<ConnectionTracker>,
    scrape_interval: Duration,
    backoff: Duration,
    stop: CancellationToken,
}

impl<C: ConnectionInfoClient> NetworkStatusNotifier<C> {
    pub fn new(
        client: C,
        scraper: Arc<dyn Scraper>,
        tracker: Arc<ConnectionTracker>,
        scrape_interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            client,
            scraper,
            tracker,
            scrape_interval,
            backoff: RECONNECT_BACKOFF,
            stop,
        }
    }

    /// Overrides the reconnect backoff (mainly for tests).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until the stop signal fires.
    pub async fn run(self) {
        let mut last_sent_conns = ConnMap::default();
        let mut last_sent_endpoints = EndpointMap::default();

        while !self.stop.is_cancelled() {
            if !self.client.ready(&self.stop).await {
                if self.stop.is_cancelled() {
                    return;
                }
                debug!("aggregator channel not ready; backing off");
                if !pause(self.backoff, &self.stop).await {
                    return;
                }
                continue;
            }

            let handles = match self.client.open_stream().await {
                Ok(handles) => handles,
                Err(err) => {
                    warn!(error = %err, "failed to open connection info stream");
                    if !pause(self.backoff, &self.stop).await {
                        return;
                    }
                    continue;
                }
            };
            info!("connection info stream established");

            self.stream_loop(handles, &mut last_sent_conns, &mut last_sent_endpoints)
                .await;
            if self.stop.is_cancelled() {
                return;
            }
            if !pause(self.backoff, &self.stop).await {
                return;
            }
        }
    }

    /// One stream session: returns when the stream breaks or the stop
    /// signal fires.
    async fn stream_loop(
        &self,
        handles: StreamHandles,
        last_sent_conns: &mut ConnMap,
        last_sent_endpoints: &mut EndpointMap,
    ) {
        let StreamHandles { mut stream, mut control } = handles;
        let mut ticker = tokio::time::interval(self.scrape_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                received = control.recv() => match received {
                    Some(msg) => self.handle_control(msg),
                    None => {
                        warn!("control stream closed; reconnecting");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !self
                        .run_tick(stream.as_mut(), last_sent_conns, last_sent_endpoints)
                        .await
                    {
                        return;
                    }
                }
            }
        }
    }

    /// One tick: scrape, merge, fetch, diff, send. Returns false when the
    /// stream should be dropped. A failed scrape or an empty delta just
    /// skips the send.
    async fn run_tick(
        &self,
        stream: &mut dyn ConnectionInfoStream,
        last_sent_conns: &mut ConnMap,
        last_sent_endpoints: &mut EndpointMap,
    ) -> bool {
        let scraper = Arc::clone(&self.scraper);
        let scraped = match tokio::task::spawn_blocking(move || scraper.scrape()).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(error = %err, "scrape failed; skipping tick");
                return true;
            }
            Err(err) => {
                warn!(error = %err, "scrape task panicked; skipping tick");
                return true;
            }
        };

        let now = now_micros();
        self.tracker
            .update(&scraped.connections, &scraped.listen_endpoints, now);
        let new_conns = self.tracker.fetch_conn_state(true, true);
        let new_endpoints = self.tracker.fetch_endpoint_state(true, true);

        // Diff against clones: the retained snapshots must survive a
        // failed write so the next attempt rebuilds the same delta.
        let mut conn_delta = last_sent_conns.clone();
        ConnectionTracker::compute_delta(&new_conns, &mut conn_delta);
        let mut endpoint_delta = last_sent_endpoints.clone();
        ConnectionTracker::compute_delta(&new_endpoints, &mut endpoint_delta);

        if conn_delta.is_empty() && endpoint_delta.is_empty() {
            *last_sent_conns = new_conns;
            *last_sent_endpoints = new_endpoints;
            return true;
        }

        debug!(
            connections = conn_delta.len(),
            endpoints = endpoint_delta.len(),
            "sending connection info delta"
        );
        let msg = proto::info_message(&conn_delta, &endpoint_delta, now);
        match tokio::time::timeout(self.scrape_interval, stream.send(msg)).await {
            Ok(Ok(())) => {
                *last_sent_conns = new_conns;
                *last_sent_endpoints = new_endpoints;
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "stream write failed; dropping stream");
                false
            }
            Err(_) => {
                warn!("stream write missed its deadline; dropping stream");
                false
            }
        }
    }

    fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::KnownNetworks(update) => match build_network_tree(&update) {
                Ok(tree) => {
                    info!(networks = tree.len(), "known networks updated");
                    self.tracker.update_known_networks(tree);
                }
                Err(err) => {
                    warn!(error = %err, "rejecting known-networks update");
                }
            },
            ControlMessage::PublicIps(update) => {
                let ips = decode_public_ips(&update);
                info!(addresses = ips.len(), "known public IPs updated");
                self.tracker.update_known_public_ips(ips);
            }
        }
    }
}

/// Builds a fresh lookup tree from a networks update. Duplicate records
/// are ignored; malformed ones reject the whole update so the previous
/// tree stays in place.
fn build_network_tree(update: &IpNetworksUpdate) -> Result<NetworkTree, NotifyError> {
    let mut tree = NetworkTree::new();
    for (family, data) in [
        (Family::V4, &update.ipv4_networks),
        (Family::V6, &update.ipv6_networks),
    ] {
        for network in parse_network_records(data, family)? {
            if !tree.insert(network) {
                debug!(%network, "duplicate known network ignored");
            }
        }
    }
    Ok(tree)
}

fn decode_public_ips(update: &PublicIpsUpdate) -> AHashSet<Address> {
    let mut ips = AHashSet::with_capacity(update.addresses.len());
    for addr in &update.addresses {
        match proto::address_from_proto(addr) {
            Some(decoded) => {
                ips.insert(decoded);
            }
            None => debug!("skipping undecodable public IP entry"),
        }
    }
    ips
}
