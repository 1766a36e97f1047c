use crate::net::{Address, Endpoint, Family};

pub(crate) const TCP_ESTABLISHED: u8 = 0x01;
/// Unconnected sockets (UDP) report TCP_CLOSE.
pub(crate) const TCP_CLOSE: u8 = 0x07;
pub(crate) const TCP_LISTEN: u8 = 0x0a;

/// The interesting subset of one non-header line of `net/tcp[6]` (and the
/// UDP variants, which share the layout).
pub(crate) struct ConnLine {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub state: u8,
    pub inode: u64,
}

/// Parses one `net/tcp[6]` line. Returns `None` for malformed lines, which
/// callers skip.
///
/// Fields are whitespace-separated:
/// `sl local_address rem_address st tx:rx tr:tm->when retrnsmt uid timeout inode ...`
pub(crate) fn parse_conn_line(line: &str, family: Family) -> Option<ConnLine> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = parse_table_endpoint(fields.next()?, family)?;
    let remote = parse_table_endpoint(fields.next()?, family)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    // Skip tx/rx queues, timer, retrnsmt, uid, timeout; field 9 is the inode.
    let inode = fields.nth(5)?.parse::<u64>().ok()?;

    Some(ConnLine { local, remote, state, inode })
}

/// Parses a `hexaddr:hexport` field. The kernel prints the raw in-memory
/// address words, so each 4-byte group is byte-swapped on little-endian
/// hosts; the port is printed as a plain host-order hex number.
fn parse_table_endpoint(field: &str, family: Family) -> Option<Endpoint> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let address = parse_table_address(addr_hex, family)?;
    if port_hex.is_empty() || port_hex.len() > 4 {
        return None;
    }
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some(Endpoint::new(address, port))
}

fn parse_table_address(hex: &str, family: Family) -> Option<Address> {
    let len = family.byte_len();
    if hex.len() != len * 2 || !hex.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
        let group = std::str::from_utf8(chunk).ok()?;
        let value = u32::from_str_radix(group, 16).ok()?;
        let group_bytes = if cfg!(target_endian = "little") {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        bytes[i * 4..(i + 1) * 4].copy_from_slice(&group_bytes);
    }
    Address::from_bytes(family, &bytes[..len])
}
