//! End-to-end tracker behavior: normalization, delta computation,
//! afterglow, and control-table swaps.

use std::net::IpAddr;
use std::time::Duration;

use ahash::AHashSet;
use muninn_agent_lib::net::{
    Address, Connection, ContainerEndpoint, ContainerId, Endpoint, Family, IpNetwork, L4Proto,
    NetworkTree,
};
use muninn_agent_lib::tracker::{ConnMap, ConnStatus, ConnectionTracker, EndpointMap};

const SECOND: i64 = 1_000_000;

fn container(s: &str) -> ContainerId {
    s.parse().unwrap()
}

fn addr(s: &str) -> Address {
    Address::from(s.parse::<IpAddr>().unwrap())
}

fn ep(address: &str, port: u16) -> Endpoint {
    Endpoint::new(addr(address), port)
}

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

fn sentinel_remote() -> Endpoint {
    Endpoint::from_network(IpNetwork::host(Address::all_ones(Family::V4)), 0)
}

fn client_conn(remote: Endpoint) -> Connection {
    Connection::new(
        container("abc123abc123"),
        ep("10.0.1.32", 54321),
        remote,
        L4Proto::Tcp,
        false,
    )
}

fn tick(tracker: &ConnectionTracker, conns: &[Connection], at: i64, old: &mut ConnMap) -> ConnMap {
    tracker.update(conns, &[], at);
    let new_state = tracker.fetch_conn_state(true, true);
    ConnectionTracker::compute_delta(&new_state, old);
    new_state
}

#[test]
fn unknown_public_remote_collapses_to_sentinel_then_known_network() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let conn = client_conn(ep("139.45.27.4", 443));

    // Tick 1: the remote is an unenrolled public address.
    let mut delta = ConnMap::default();
    let state = tick(&tracker, &[conn.clone()], SECOND, &mut delta);
    assert_eq!(delta.len(), 1);
    let (key, status) = delta.iter().next().unwrap();
    assert_eq!(key.container, container("abc123abc123"));
    assert!(key.local.is_null());
    assert_eq!(key.remote, sentinel_remote());
    assert_eq!(key.protocol, L4Proto::Tcp);
    assert!(!key.is_server);
    assert!(status.is_active());

    // The aggregator enrolls the remote's network.
    let mut tree = NetworkTree::new();
    assert!(tree.insert(net("139.45.0.0/16")));
    tracker.update_known_networks(tree);

    // Tick 2: the connection reappears under the known network, and the
    // sentinel entry is reported closed.
    let mut delta = state.clone();
    tick(&tracker, &[conn], 2 * SECOND, &mut delta);
    assert_eq!(delta.len(), 2);

    let added: Vec<_> = delta.iter().filter(|(_, s)| s.is_active()).collect();
    let removed: Vec<_> = delta.iter().filter(|(_, s)| !s.is_active()).collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].0.remote, Endpoint::from_network(net("139.45.0.0/16"), 0));
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].0.remote, sentinel_remote());
}

#[test]
fn listen_endpoint_reported_once_then_quiet() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let listener = ContainerEndpoint::new(
        container("def456def456"),
        ep("0.0.0.0", 8080),
        L4Proto::Tcp,
    );

    tracker.update(&[], &[listener.clone()], SECOND);
    let state = tracker.fetch_endpoint_state(true, true);
    let mut delta = EndpointMap::default();
    ConnectionTracker::compute_delta(&state, &mut delta);
    assert_eq!(delta.len(), 1);
    let (key, status) = delta.iter().next().unwrap();
    assert_eq!(key.container, container("def456def456"));
    assert_eq!(key.endpoint, ep("0.0.0.0", 8080));
    assert_eq!(key.protocol, L4Proto::Tcp);
    assert!(status.is_active());

    // Identical state on the next tick produces an empty delta.
    tracker.update(&[], &[listener], 2 * SECOND);
    let new_state = tracker.fetch_endpoint_state(true, true);
    let mut delta = state;
    ConnectionTracker::compute_delta(&new_state, &mut delta);
    assert!(delta.is_empty());
}

#[test]
fn listen_endpoint_address_is_canonicalized_to_any() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let listener = ContainerEndpoint::new(
        container("def456def456"),
        ep("10.0.0.7", 9000),
        L4Proto::Tcp,
    );
    let loopback = ContainerEndpoint::new(
        container("def456def456"),
        ep("127.0.0.1", 9001),
        L4Proto::Tcp,
    );

    tracker.update(&[], &[listener, loopback], SECOND);
    let state = tracker.fetch_endpoint_state(true, true);
    assert_eq!(state.len(), 1);
    let key = state.keys().next().unwrap();
    assert_eq!(key.endpoint, ep("0.0.0.0", 9000));
}

#[test]
fn closed_connection_reports_close_timestamp_then_disappears() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let conn = client_conn(ep("10.9.9.9", 443)); // private remote stays as-is

    let mut sent = ConnMap::default();
    let state = tick(&tracker, &[conn.clone()], SECOND, &mut sent);
    assert_eq!(sent.len(), 1);

    // Tick N+1: the connection is gone.
    let mut delta = state;
    let new_state = tick(&tracker, &[], 2 * SECOND, &mut delta);
    assert_eq!(delta.len(), 1);
    let (key, status) = delta.iter().next().unwrap();
    assert_eq!(key.remote, Endpoint::from_network(IpNetwork::host(addr("10.9.9.9")), 0));
    assert!(!status.is_active());
    assert_eq!(status.last_active_micros(), 2 * SECOND);
    // The snapshot carried the closed entry; the live state dropped it.
    assert_eq!(new_state.len(), 1);
    assert!(tracker.fetch_conn_state(true, true).is_empty());
}

#[test]
fn afterglow_holds_flapping_connection_active() {
    let tracker = ConnectionTracker::new(Duration::from_secs(20));
    let conn = client_conn(ep("10.9.9.9", 443));

    let mut sent = ConnMap::default();
    tick(&tracker, &[conn.clone()], 0, &mut sent);
    assert_eq!(sent.len(), 1);
    let mut sent = tracker.fetch_conn_state(true, false);

    // t=10s: absent, but the grace window holds it active.
    let mut delta = sent.clone();
    sent = tick(&tracker, &[], 10 * SECOND, &mut delta);
    assert!(delta.is_empty());

    // t=15s: back again; the hold resets without any delta traffic.
    let mut delta = sent.clone();
    tick(&tracker, &[conn], 15 * SECOND, &mut delta);
    assert!(delta.is_empty());
}

#[test]
fn afterglow_expiry_reports_inactive() {
    let tracker = ConnectionTracker::new(Duration::from_secs(20));
    let conn = client_conn(ep("10.9.9.9", 443));

    let mut sent = ConnMap::default();
    tick(&tracker, &[conn.clone()], 0, &mut sent);
    let mut sent = tracker.fetch_conn_state(true, false);

    // t=10s: absent, held.
    let mut delta = sent.clone();
    sent = tick(&tracker, &[], 10 * SECOND, &mut delta);
    assert!(delta.is_empty());

    // t=25s: still absent and past last_active + period: genuinely closed.
    let mut delta = sent.clone();
    tick(&tracker, &[], 25 * SECOND, &mut delta);
    assert_eq!(delta.len(), 1);
    let (_, status) = delta.iter().next().unwrap();
    assert!(!status.is_active());
}

#[test]
fn udp_role_is_inferred_from_port_ephemerality() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    // Fed by the syscall driver with the wrong role.
    let conn = Connection::new(
        container("abc123abc123"),
        ep("10.0.0.5", 50000),
        ep("10.0.0.6", 53),
        L4Proto::Udp,
        true,
    );

    tracker.update(&[conn], &[], SECOND);
    let state = tracker.fetch_conn_state(true, true);
    assert_eq!(state.len(), 1);
    let key = state.keys().next().unwrap();
    assert!(!key.is_server, "ephemeral(50000) > ephemeral(53) makes the local side the client");
    assert!(key.local.is_null());
    assert_eq!(key.remote, Endpoint::from_network(IpNetwork::host(addr("10.0.0.6")), 0));
    assert_eq!(key.protocol, L4Proto::Udp);
}

#[test]
fn known_public_ip_passes_through_unsquashed() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let conn = client_conn(ep("8.8.8.8", 53));

    tracker.update(&[conn.clone()], &[], SECOND);
    let state = tracker.fetch_conn_state(true, true);
    assert_eq!(state.keys().next().unwrap().remote, sentinel_remote());

    let mut ips = AHashSet::new();
    ips.insert(addr("8.8.8.8"));
    tracker.update_known_public_ips(ips);

    tracker.update(&[conn], &[], 2 * SECOND);
    let state = tracker.fetch_conn_state(true, true);
    assert!(state
        .keys()
        .any(|k| k.remote == Endpoint::from_network(IpNetwork::host(addr("8.8.8.8")), 0)));
}

#[test]
fn update_marks_exactly_the_observed_keys_active() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let a = client_conn(ep("10.0.0.1", 80));
    let b = Connection::new(
        container("def456def456"),
        ep("10.0.0.2", 8080),
        ep("10.0.0.3", 40000),
        L4Proto::Tcp,
        true,
    );

    tracker.update(&[a.clone(), b.clone()], &[], 5 * SECOND);
    let state = tracker.fetch_conn_state(true, false);
    assert_eq!(state.len(), 2);
    for (key, status) in &state {
        assert!(status.is_active(), "{key} should be active");
        assert!(status.last_active_micros() >= 5 * SECOND);
        // Normalization preserved container, protocol, and role.
        assert!(key.container == a.container || key.container == b.container);
        assert_eq!(key.protocol, L4Proto::Tcp);
    }

    // The next update without `a` leaves only `b`'s key active.
    tracker.update(&[b], &[], 6 * SECOND);
    let state = tracker.fetch_conn_state(true, false);
    let active: Vec<_> = state.iter().filter(|(_, s)| s.is_active()).collect();
    assert_eq!(active.len(), 1);
    assert!(active[0].0.is_server);
    assert_eq!(active[0].0.local.port(), 8080);
}

#[test]
fn loopback_remotes_are_never_tracked() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    tracker.update(&[client_conn(ep("127.0.0.1", 80))], &[], SECOND);
    assert!(tracker.fetch_conn_state(true, true).is_empty());

    tracker.add_connection(&client_conn(ep("127.0.0.1", 80)), SECOND);
    assert!(tracker.fetch_conn_state(true, true).is_empty());
}

#[test]
fn event_driven_add_and_remove() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let conn = client_conn(ep("10.3.3.3", 443));

    tracker.add_connection(&conn, SECOND);
    let state = tracker.fetch_conn_state(true, false);
    assert_eq!(state.len(), 1);
    assert!(state.values().next().unwrap().is_active());

    // A stale close (older timestamp) is ignored.
    tracker.remove_connection(&conn, SECOND / 2);
    assert!(tracker
        .fetch_conn_state(true, false)
        .values()
        .next()
        .unwrap()
        .is_active());

    tracker.remove_connection(&conn, 2 * SECOND);
    let state = tracker.fetch_conn_state(true, true);
    let status = state.values().next().unwrap();
    assert!(!status.is_active());
    assert_eq!(status.last_active_micros(), 2 * SECOND);
    assert!(tracker.fetch_conn_state(true, true).is_empty());
}

#[test]
fn renormalization_preserves_timestamps() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let conn = client_conn(ep("139.45.27.4", 443));
    tracker.update(&[conn], &[], 7 * SECOND);

    let mut tree = NetworkTree::new();
    assert!(tree.insert(net("139.45.0.0/16")));
    tracker.update_known_networks(tree);

    let state = tracker.fetch_conn_state(true, false);
    assert_eq!(state.len(), 1);
    assert_eq!(state.values().next().unwrap().last_active_micros(), 7 * SECOND);
}

#[test]
fn longest_prefix_wins_for_known_networks() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let mut tree = NetworkTree::new();
    assert!(tree.insert(net("139.0.0.0/8")));
    assert!(tree.insert(net("139.45.0.0/16")));
    tracker.update_known_networks(tree);

    tracker.update(&[client_conn(ep("139.45.27.4", 443))], &[], SECOND);
    let state = tracker.fetch_conn_state(true, true);
    assert_eq!(
        state.keys().next().unwrap().remote,
        Endpoint::from_network(net("139.45.0.0/16"), 0)
    );
}

fn apply_delta(receiver: &mut ConnMap, delta: &ConnMap) {
    for (key, status) in delta {
        receiver.insert(key.clone(), *status);
    }
    receiver.retain(|_, status| status.is_active());
}

#[test]
fn applying_a_delta_twice_is_idempotent() {
    let tracker = ConnectionTracker::new(Duration::ZERO);
    let a = client_conn(ep("10.0.0.1", 80));
    let b = client_conn(ep("10.0.0.2", 81));

    let mut sent = ConnMap::default();
    let old_state = tick(&tracker, &[a.clone(), b.clone()], SECOND, &mut sent);

    // Second tick: `a` closes.
    tracker.update(&[b], &[], 2 * SECOND);
    let new_state = tracker.fetch_conn_state(true, true);
    let mut delta = old_state.clone();
    ConnectionTracker::compute_delta(&new_state, &mut delta);

    let mut receiver: ConnMap = old_state
        .iter()
        .filter(|(_, s)| s.is_active())
        .map(|(k, s)| (k.clone(), *s))
        .collect();
    apply_delta(&mut receiver, &delta);
    let once = receiver.clone();
    apply_delta(&mut receiver, &delta);
    assert_eq!(once, receiver);

    let expected_active: ConnMap = new_state
        .iter()
        .filter(|(_, s)| s.is_active())
        .map(|(k, s)| (k.clone(), *s))
        .collect();
    assert_eq!(receiver, expected_active);
}

#[test]
fn delta_keeps_newer_close_timestamps_only() {
    let mut old: ConnMap = ConnMap::default();
    let mut new: ConnMap = ConnMap::default();
    let conn = client_conn(ep("10.0.0.1", 80));

    old.insert(conn.clone(), ConnStatus::new(SECOND, false));
    new.insert(conn.clone(), ConnStatus::new(SECOND, false));
    let mut delta = old.clone();
    ConnectionTracker::compute_delta(&new, &mut delta);
    assert!(delta.is_empty(), "same inactive timestamp is not a change");

    new.insert(conn, ConnStatus::new(2 * SECOND, false));
    let mut delta = old;
    ConnectionTracker::compute_delta(&new, &mut delta);
    assert_eq!(delta.len(), 1);
    assert_eq!(delta.values().next().unwrap().last_active_micros(), 2 * SECOND);
}
