use std::fs;
use std::io;
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use tracing::debug;

use crate::net::{Address, Connection, ContainerEndpoint, ContainerId, Endpoint, Family, L4Proto};
use crate::scraper::cgroup::read_container_id;
use crate::scraper::tcp_table::{parse_conn_line, TCP_CLOSE, TCP_ESTABLISHED, TCP_LISTEN};
use crate::scraper::{ScrapeError, ScrapeResult};

struct ConnInfo {
    local: Endpoint,
    remote: Endpoint,
    protocol: L4Proto,
    is_server: bool,
}

struct ListenInfo {
    endpoint: Endpoint,
    protocol: L4Proto,
}

/// Connection and listener tables of one network namespace, keyed by
/// socket inode.
#[derive(Default)]
struct NsTables {
    conns: AHashMap<u64, ConnInfo>,
    listeners: AHashMap<u64, ListenInfo>,
}

type ConnsByNs = AHashMap<u64, NsTables>;
type SocketsByContainer = AHashMap<ContainerId, AHashMap<u64, AHashSet<u64>>>;

/// Reads all container connections and listen endpoints from a
/// `/proc`-like tree. Per-process failures are logged and skipped; only an
/// unreadable proc root fails the scrape.
pub(crate) fn read_container_connections(
    proc_root: &Path,
    udp_listeners: bool,
) -> Result<ScrapeResult, ScrapeError> {
    let entries = fs::read_dir(proc_root).map_err(|source| ScrapeError {
        path: proc_root.to_path_buf(),
        source,
    })?;

    let mut conns_by_ns = ConnsByNs::default();
    let mut sockets_by_container = SocketsByContainer::default();
    let mut skipped = 0usize;

    for entry in entries {
        let Ok(entry) = entry else {
            skipped += 1;
            continue;
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }

        if let Err(err) = scrape_pid(
            &entry.path(),
            &mut conns_by_ns,
            &mut sockets_by_container,
            udp_listeners,
        ) {
            skipped += 1;
            debug!(pid = name, error = %err, "skipping process");
        }
    }

    if skipped > 0 {
        debug!(skipped, "some processes could not be scraped");
    }

    Ok(resolve_socket_inodes(&sockets_by_container, &conns_by_ns))
}

fn scrape_pid(
    pid_dir: &Path,
    conns_by_ns: &mut ConnsByNs,
    sockets_by_container: &mut SocketsByContainer,
    udp_listeners: bool,
) -> io::Result<()> {
    if is_zombie(pid_dir)? {
        return Ok(());
    }
    let Some(container_id) = read_container_id(pid_dir)? else {
        return Ok(()); // not a container process
    };
    let Some(netns) = read_inode_link(&pid_dir.join("ns/net"), "net") else {
        return Err(io::Error::other("could not determine network namespace"));
    };

    let ns_sockets = sockets_by_container
        .entry(container_id)
        .or_default()
        .entry(netns)
        .or_default();
    let had_sockets = !ns_sockets.is_empty();
    collect_socket_inodes(pid_dir, ns_sockets)?;

    if had_sockets || ns_sockets.is_empty() || conns_by_ns.contains_key(&netns) {
        return Ok(());
    }

    // First sockets seen for this (container, netns) pair: read the
    // namespace's connection tables through this process's proc entry.
    let mut tables = NsTables::default();
    match fill_ns_tables(pid_dir, &mut tables, udp_listeners) {
        Ok(()) => {
            conns_by_ns.insert(netns, tables);
            Ok(())
        }
        Err(err) => {
            // Distinguish a vanished process from a persistent error by
            // re-reading the netns inode.
            if read_inode_link(&pid_dir.join("ns/net"), "net") == Some(netns) {
                conns_by_ns.insert(netns, tables);
                Err(err)
            } else {
                Ok(()) // process went away mid-read; drop the partial record
            }
        }
    }
}

/// A zombie's state is reported as 'Z' between the final ')' and the next
/// field of `stat`; locating the last ')' tolerates commands containing
/// parens.
fn is_zombie(pid_dir: &Path) -> io::Result<bool> {
    let stat = fs::read_to_string(pid_dir.join("stat"))?;
    let state = stat
        .rfind(')')
        .map(|i| stat[i + 1..].trim_start())
        .unwrap_or("");
    Ok(state.starts_with('Z'))
}

/// Reads the inode from a symlink of the form `<prefix>:[<inode>]`.
fn read_inode_link(path: &Path, prefix: &str) -> Option<u64> {
    let target = fs::read_link(path).ok()?;
    let target = target.to_str()?;
    target
        .strip_prefix(prefix)?
        .strip_prefix(":[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Collects the socket inodes of all open file descriptors of a process.
fn collect_socket_inodes(pid_dir: &Path, inodes: &mut AHashSet<u64>) -> io::Result<()> {
    let fd_dir = pid_dir.join("fd");
    for entry in fs::read_dir(&fd_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        if let Some(inode) = read_inode_link(&entry.path(), "socket") {
            inodes.insert(inode);
        }
    }
    Ok(())
}

/// Every table is attempted regardless of earlier failures; whatever
/// parses is merged, and the first error is reported afterwards so one
/// unreadable file does not lose the other families' data.
fn fill_ns_tables(pid_dir: &Path, tables: &mut NsTables, udp_listeners: bool) -> io::Result<()> {
    let tcp = read_connections_file(&pid_dir.join("net/tcp"), Family::V4, tables);
    let tcp6 = read_connections_file(&pid_dir.join("net/tcp6"), Family::V6, tables);
    let mut first_err = tcp.err().or(tcp6.err());

    if udp_listeners {
        let udp = read_udp_listeners_file(&pid_dir.join("net/udp"), Family::V4, tables);
        let udp6 = read_udp_listeners_file(&pid_dir.join("net/udp6"), Family::V6, tables);
        first_err = first_err.or(udp.err()).or(udp6.err());
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn read_connections_file(path: &Path, family: Family, tables: &mut NsTables) -> io::Result<()> {
    let content = fs::read_to_string(path)?;
    let mut listen_set: AHashSet<Endpoint> = AHashSet::new();

    for line in content.lines().skip(1) {
        let Some(data) = parse_conn_line(line, family) else {
            continue;
        };
        if data.state == TCP_LISTEN {
            // The table lists all listen sockets before any established
            // entry, so the set is complete before role inference runs.
            listen_set.insert(data.local);
            if data.inode != 0 {
                tables.listeners.insert(
                    data.inode,
                    ListenInfo { endpoint: data.local, protocol: L4Proto::Tcp },
                );
            }
            continue;
        }
        if data.state != TCP_ESTABLISHED {
            continue;
        }
        if data.inode == 0 {
            continue; // socket closed or otherwise unavailable
        }
        let is_server = local_is_server(&data.local, &data.remote, &listen_set);
        tables.conns.insert(
            data.inode,
            ConnInfo {
                local: data.local,
                remote: data.remote,
                protocol: L4Proto::Tcp,
                is_server,
            },
        );
    }
    Ok(())
}

/// An unconnected UDP socket (zero remote, state TCP_CLOSE) counts as a
/// listener.
fn read_udp_listeners_file(path: &Path, family: Family, tables: &mut NsTables) -> io::Result<()> {
    let content = fs::read_to_string(path)?;
    for line in content.lines().skip(1) {
        let Some(data) = parse_conn_line(line, family) else {
            continue;
        };
        if data.state != TCP_CLOSE || data.inode == 0 || !data.remote.is_null() {
            continue;
        }
        tables.listeners.insert(
            data.inode,
            ListenInfo { endpoint: data.local, protocol: L4Proto::Udp },
        );
    }
    Ok(())
}

/// True if the local end of an established connection looks like the
/// server side.
fn local_is_server(local: &Endpoint, remote: &Endpoint, listen_set: &AHashSet<Endpoint>) -> bool {
    if listen_set.contains(local) {
        return true;
    }
    // Listening on the same port on any interface also counts.
    let local_any = Endpoint::new(Address::any(local.address().family()), local.port());
    if listen_set.contains(&local_any) {
        return true;
    }
    // Closing a listen socket does not terminate established connections,
    // so fall back to comparing which port looks more ephemeral.
    crate::net::is_ephemeral(remote.port()) > crate::net::is_ephemeral(local.port())
}

fn resolve_socket_inodes(
    sockets_by_container: &SocketsByContainer,
    conns_by_ns: &ConnsByNs,
) -> ScrapeResult {
    let mut result = ScrapeResult::default();
    for (container_id, by_ns) in sockets_by_container {
        for (netns, inodes) in by_ns {
            let Some(tables) = conns_by_ns.get(netns) else {
                continue;
            };
            for inode in inodes {
                if let Some(conn) = tables.conns.get(inode) {
                    if !conn.remote.address().is_local() {
                        result.connections.push(Connection::new(
                            *container_id,
                            conn.local,
                            conn.remote,
                            conn.protocol,
                            conn.is_server,
                        ));
                    }
                }
                if let Some(listen) = tables.listeners.get(inode) {
                    result.listen_endpoints.push(ContainerEndpoint::new(
                        *container_id,
                        listen.endpoint,
                        listen.protocol,
                    ));
                }
            }
        }
    }
    result
}
