//! In-memory state machine over observed connections and listen
//! endpoints: liveness tracking, normalization against the known-network
//! tables, afterglow suppression of short-lived flaps, and delta
//! computation against a previously sent state.

use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};

use crate::net::{
    is_ephemeral, Address, Connection, ContainerEndpoint, Endpoint, Family, IpNetwork, L4Proto,
    NetworkTree,
};

/// Liveness of one tracked connection or endpoint: the timestamp it was
/// last seen alive (microseconds since epoch) in the low 63 bits, packed
/// with an active flag in the top bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnStatus(u64);

const ACTIVE_FLAG: u64 = 1 << 63;

impl ConnStatus {
    pub fn new(micros: i64, active: bool) -> Self {
        let ts = micros.max(0) as u64 & !ACTIVE_FLAG;
        Self(if active { ts | ACTIVE_FLAG } else { ts })
    }

    pub fn last_active_micros(&self) -> i64 {
        (self.0 & !ACTIVE_FLAG) as i64
    }

    pub fn is_active(&self) -> bool {
        self.0 & ACTIVE_FLAG != 0
    }

    pub fn set_active(&mut self, active: bool) {
        if active {
            self.0 |= ACTIVE_FLAG;
        } else {
            self.0 &= !ACTIVE_FLAG;
        }
    }

    /// Keeps the maximum of the packed values: a later timestamp wins,
    /// and at equal timestamps active wins over inactive.
    pub fn merge_from(&mut self, other: ConnStatus) {
        self.0 = self.0.max(other.0);
    }
}

pub type ConnMap = AHashMap<Connection, ConnStatus>;
pub type EndpointMap = AHashMap<ContainerEndpoint, ConnStatus>;

struct TrackerState {
    conn_state: ConnMap,
    endpoint_state: EndpointMap,
    known_networks: NetworkTree,
    known_public_ips: AHashSet<Address>,
    conn_afterglow: AHashMap<Connection, i64>,
    endpoint_afterglow: AHashMap<ContainerEndpoint, i64>,
    afterglow_period_micros: i64,
}

/// Tracks the liveness of every observed (container, endpoint-pair,
/// protocol, role) tuple. All mutations are total and serialize on one
/// internal lock; snapshots are copied out so no I/O ever happens under
/// it.
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
}

impl ConnectionTracker {
    /// `afterglow_period` defers active→inactive transitions to suppress
    /// flaps from short-lived connections; zero disables it.
    pub fn new(afterglow_period: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                conn_state: ConnMap::default(),
                endpoint_state: EndpointMap::default(),
                known_networks: NetworkTree::new(),
                known_public_ips: AHashSet::new(),
                conn_afterglow: AHashMap::new(),
                endpoint_afterglow: AHashMap::new(),
                afterglow_period_micros: afterglow_period.as_micros() as i64,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bulk merge of one scrape: every current entry not present in the
    /// scrape ages toward inactive, every observation is normalized and
    /// inserted (or refreshed, keeping the maximum timestamp seen).
    pub fn update(
        &self,
        all_conns: &[Connection],
        all_listen_endpoints: &[ContainerEndpoint],
        now_micros: i64,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let observed_conns: Vec<Connection> = all_conns
            .iter()
            .filter(|conn| !conn.remote.address().is_local())
            .map(|conn| state.normalize_connection(conn))
            .collect();
        let observed_endpoints: Vec<ContainerEndpoint> = all_listen_endpoints
            .iter()
            .filter_map(|ep| state.normalize_endpoint(ep))
            .collect();

        let period = state.afterglow_period_micros;
        age_and_merge(
            &mut state.conn_state,
            &mut state.conn_afterglow,
            period,
            observed_conns,
            now_micros,
        );
        age_and_merge(
            &mut state.endpoint_state,
            &mut state.endpoint_afterglow,
            period,
            observed_endpoints,
            now_micros,
        );
    }

    /// Event-driven insert from the syscall-driver path.
    pub fn add_connection(&self, conn: &Connection, timestamp_micros: i64) {
        self.update_connection(conn, timestamp_micros, true);
    }

    /// Event-driven close from the syscall-driver path.
    pub fn remove_connection(&self, conn: &Connection, timestamp_micros: i64) {
        self.update_connection(conn, timestamp_micros, false);
    }

    fn update_connection(&self, conn: &Connection, timestamp_micros: i64, added: bool) {
        if conn.remote.address().is_local() {
            return;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = state.normalize_connection(conn);
        if added {
            state.conn_afterglow.remove(&key);
        }
        emplace_or_update(&mut state.conn_state, key, ConnStatus::new(timestamp_micros, added));
    }

    /// Swaps in a new known-networks tree and renormalizes every tracked
    /// entry under it (timestamps preserved).
    pub fn update_known_networks(&self, tree: NetworkTree) {
        let mut state = self.lock();
        state.known_networks = tree;
        state.renormalize();
    }

    /// Swaps the known-public-IP set and renormalizes.
    pub fn update_known_public_ips(&self, ips: AHashSet<Address>) {
        let mut state = self.lock();
        state.known_public_ips = ips;
        state.renormalize();
    }

    /// Copies out the connection state. With `clear_inactive`, inactive
    /// entries are removed from the live state after the snapshot is
    /// taken, so a closed connection is reported exactly once.
    pub fn fetch_conn_state(&self, normalize: bool, clear_inactive: bool) -> ConnMap {
        let mut guard = self.lock();
        let state = &mut *guard;

        let snapshot = if normalize {
            let mut snap = ConnMap::with_capacity(state.conn_state.len());
            for (key, status) in &state.conn_state {
                merge_entry(&mut snap, state.normalize_connection(key), *status);
            }
            snap
        } else {
            state.conn_state.clone()
        };

        if clear_inactive {
            state.conn_state.retain(|_, status| status.is_active());
            let conn_state = &state.conn_state;
            state
                .conn_afterglow
                .retain(|key, _| conn_state.contains_key(key));
        }
        snapshot
    }

    /// Endpoint counterpart of [`fetch_conn_state`].
    ///
    /// [`fetch_conn_state`]: ConnectionTracker::fetch_conn_state
    pub fn fetch_endpoint_state(&self, normalize: bool, clear_inactive: bool) -> EndpointMap {
        let mut guard = self.lock();
        let state = &mut *guard;

        let snapshot = if normalize {
            let mut snap = EndpointMap::with_capacity(state.endpoint_state.len());
            for (key, status) in &state.endpoint_state {
                if let Some(key) = state.normalize_endpoint(key) {
                    merge_entry(&mut snap, key, *status);
                }
            }
            snap
        } else {
            state.endpoint_state.clone()
        };

        if clear_inactive {
            state.endpoint_state.retain(|_, status| status.is_active());
            let endpoint_state = &state.endpoint_state;
            state
                .endpoint_afterglow
                .retain(|key, _| endpoint_state.contains_key(key));
        }
        snapshot
    }

    /// Computes the diff between `new_state` and `old_state`, leaving the
    /// delta to send in `old_state`:
    ///
    /// - present in both and both active: omitted (no change)
    /// - present in both with differing activity: included with the new
    ///   status (resurrected or newly closed)
    /// - present in both, both inactive: included only if the new
    ///   timestamp is later
    /// - only in the new state: included (add)
    /// - only in the old state and was active: included as a close
    /// - only in the old state and already inactive: dropped
    pub fn compute_delta<K: Eq + Hash + Clone>(
        new_state: &AHashMap<K, ConnStatus>,
        old_state: &mut AHashMap<K, ConnStatus>,
    ) {
        for (key, status) in new_state {
            match old_state.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(*status);
                }
                Entry::Occupied(mut entry) => {
                    let old = *entry.get();
                    if status.is_active() != old.is_active() {
                        entry.insert(*status);
                    } else if status.is_active() {
                        entry.remove();
                    } else if old.last_active_micros() < status.last_active_micros() {
                        entry.insert(*status);
                    } else {
                        entry.remove();
                    }
                }
            }
        }

        old_state.retain(|key, status| {
            if new_state.contains_key(key) {
                return true;
            }
            if status.is_active() {
                status.set_active(false);
                true
            } else {
                false
            }
        });
    }
}

impl TrackerState {
    fn normalize_connection(&self, conn: &Connection) -> Connection {
        let mut is_server = conn.is_server;
        if conn.protocol == L4Proto::Udp && conn.remote.port() != 0 {
            // LISTEN does not exist for UDP, so the supplied role is
            // unreliable; the more ephemeral side is the client. Already
            // normalized tuples carry a zero remote port and keep their
            // role.
            is_server = is_ephemeral(conn.remote.port()) > is_ephemeral(conn.local.port());
        }

        let remote = Endpoint::from_network(self.normalize_network(conn.remote.network()), 0);
        let local = if is_server {
            // Only the local port is relevant on the server side.
            Endpoint::from_network(IpNetwork::default(), conn.local.port())
        } else {
            Endpoint::null()
        };

        Connection {
            container: conn.container,
            local,
            remote,
            protocol: conn.protocol,
            is_server,
        }
    }

    /// Classifies a remote network: known CIDRs map to their enclosing
    /// network, private and explicitly enrolled public addresses pass
    /// through, and everything else collapses onto the family's all-ones
    /// sentinel so the aggregator never sees unenrolled foreign IPs.
    fn normalize_network(&self, net: &IpNetwork) -> IpNetwork {
        if net.is_null() {
            return *net;
        }
        if let Some(known) = self.known_networks.find(net) {
            return known;
        }
        if net.family() == Family::V4 {
            if let Some(known) = self.known_networks.find(&to_v6_network(net)) {
                return known;
            }
        }
        let address = net.address();
        if !address.is_public() {
            return *net;
        }
        if self.known_public_ips.contains(address) {
            return *net;
        }
        IpNetwork::host(Address::all_ones(net.family()))
    }

    /// Listen endpoints on loopback are dropped; everything else
    /// canonicalizes to listen-on-any with the port and protocol kept.
    fn normalize_endpoint(&self, ep: &ContainerEndpoint) -> Option<ContainerEndpoint> {
        let address = ep.endpoint.address();
        if address.is_local() {
            return None;
        }
        Some(ContainerEndpoint {
            container: ep.container,
            endpoint: Endpoint::new(Address::any(address.family()), ep.endpoint.port()),
            protocol: ep.protocol,
        })
    }

    /// Re-keys the live state (and the afterglow map alongside it) through
    /// the current normalization. Statuses merge by maximum; colliding
    /// afterglow entries keep the latest expiry.
    fn renormalize(&mut self) {
        let mut conn_state = ConnMap::with_capacity(self.conn_state.len());
        let mut conn_afterglow = AHashMap::new();
        for (key, status) in &self.conn_state {
            let new_key = self.normalize_connection(key);
            if let Some(&expires_at) = self.conn_afterglow.get(key) {
                let slot = conn_afterglow.entry(new_key.clone()).or_insert(expires_at);
                *slot = (*slot).max(expires_at);
            }
            merge_entry(&mut conn_state, new_key, *status);
        }
        self.conn_state = conn_state;
        self.conn_afterglow = conn_afterglow;

        let mut endpoint_state = EndpointMap::with_capacity(self.endpoint_state.len());
        let mut endpoint_afterglow = AHashMap::new();
        for (key, status) in &self.endpoint_state {
            let Some(new_key) = self.normalize_endpoint(key) else {
                continue;
            };
            if let Some(&expires_at) = self.endpoint_afterglow.get(key) {
                let slot = endpoint_afterglow.entry(new_key.clone()).or_insert(expires_at);
                *slot = (*slot).max(expires_at);
            }
            merge_entry(&mut endpoint_state, new_key, *status);
        }
        self.endpoint_state = endpoint_state;
        self.endpoint_afterglow = endpoint_afterglow;
    }
}

/// One round of the bulk-update state machine: age every active entry,
/// merge the fresh observations back in, then close or afterglow-hold
/// whatever was not re-observed.
fn age_and_merge<K: Eq + Hash + Clone>(
    state: &mut AHashMap<K, ConnStatus>,
    afterglow: &mut AHashMap<K, i64>,
    period_micros: i64,
    observed: Vec<K>,
    now_micros: i64,
) {
    let mut aged: Vec<K> = Vec::new();
    for (key, status) in state.iter_mut() {
        if status.is_active() {
            status.set_active(false);
            aged.push(key.clone());
        }
    }

    let fresh = ConnStatus::new(now_micros, true);
    for key in observed {
        afterglow.remove(&key);
        merge_entry(state, key, fresh);
    }

    for key in aged {
        let Some(status) = state.get_mut(&key) else {
            continue;
        };
        if status.is_active() {
            continue; // re-observed this round
        }
        if period_micros > 0 {
            let expires_at = *afterglow
                .entry(key.clone())
                .or_insert(status.last_active_micros() + period_micros);
            if now_micros < expires_at {
                // Still within the grace window: keep reporting active.
                status.set_active(true);
                continue;
            }
            afterglow.remove(&key);
        }
        *status = ConnStatus::new(now_micros, false);
    }
}

fn merge_entry<K: Eq + Hash>(state: &mut AHashMap<K, ConnStatus>, key: K, status: ConnStatus) {
    state
        .entry(key)
        .and_modify(|existing| existing.merge_from(status))
        .or_insert(status);
}

/// Insert, or overwrite only when the supplied status carries a strictly
/// newer timestamp. Used by the event-driven path, where a stale close
/// must not clobber a fresher observation.
fn emplace_or_update<K: Eq + Hash>(
    state: &mut AHashMap<K, ConnStatus>,
    key: K,
    status: ConnStatus,
) {
    match state.entry(key) {
        Entry::Vacant(entry) => {
            entry.insert(status);
        }
        Entry::Occupied(mut entry) => {
            if status.last_active_micros() > entry.get().last_active_micros() {
                entry.insert(status);
            }
        }
    }
}

fn to_v6_network(net: &IpNetwork) -> IpNetwork {
    if net.is_addr() {
        IpNetwork::host(net.address().to_v6())
    } else {
        IpNetwork::new(net.address().to_v6(), net.bits().saturating_add(96))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_packs_timestamp_and_activity() {
        let status = ConnStatus::new(1_234_567, true);
        assert!(status.is_active());
        assert_eq!(status.last_active_micros(), 1_234_567);

        let mut closed = status;
        closed.set_active(false);
        assert!(!closed.is_active());
        assert_eq!(closed.last_active_micros(), 1_234_567);
    }

    #[test]
    fn merge_keeps_newest_and_prefers_active_at_ties() {
        let mut status = ConnStatus::new(100, false);
        status.merge_from(ConnStatus::new(100, true));
        assert!(status.is_active());

        status.merge_from(ConnStatus::new(50, false));
        assert_eq!(status.last_active_micros(), 100);
        assert!(status.is_active());
    }

    #[test]
    fn emplace_ignores_stale_updates() {
        let mut state: AHashMap<u32, ConnStatus> = AHashMap::new();
        emplace_or_update(&mut state, 1, ConnStatus::new(200, true));
        emplace_or_update(&mut state, 1, ConnStatus::new(100, false));
        assert!(state[&1].is_active());
        emplace_or_update(&mut state, 1, ConnStatus::new(300, false));
        assert!(!state[&1].is_active());
        assert_eq!(state[&1].last_active_micros(), 300);
    }
}
