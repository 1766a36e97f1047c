use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::net::endpoint::Endpoint;

/// Layer-4 protocol of an observed connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum L4Proto {
    #[default]
    Unknown,
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Proto::Tcp => write!(f, "tcp"),
            L4Proto::Udp => write!(f, "udp"),
            L4Proto::Icmp => write!(f, "icmp"),
            L4Proto::Unknown => write!(f, "unknown"),
        }
    }
}

/// A container short-ID: the first 12 hex characters of the 64-character
/// container ID found in a cgroup path. Owned value, never a borrow into
/// a transient read buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId([u8; 12]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid container short-ID: {0:?}")]
pub struct InvalidContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        // Always lowercase hex by construction.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl FromStr for ContainerId {
    type Err = InvalidContainerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 12
            || !bytes
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        {
            return Err(InvalidContainerId(s.to_string()));
        }
        let mut id = [0u8; 12];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One observed connection, attributed to a container. Hash and equality
/// cover all five fields; the tracker state is keyed on this type.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub container: ContainerId,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub protocol: L4Proto,
    pub is_server: bool,
}

impl Connection {
    pub fn new(
        container: ContainerId,
        local: Endpoint,
        remote: Endpoint,
        protocol: L4Proto,
        is_server: bool,
    ) -> Self {
        Self { container, local, remote, protocol, is_server }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.is_server { "<-" } else { "->" };
        write!(
            f,
            "{}: {} {} {} [{}]",
            self.container, self.local, dir, self.remote, self.protocol
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A listening endpoint attributed to a container.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContainerEndpoint {
    pub container: ContainerId,
    pub endpoint: Endpoint,
    pub protocol: L4Proto,
}

impl ContainerEndpoint {
    pub fn new(container: ContainerId, endpoint: Endpoint, protocol: L4Proto) -> Self {
        Self { container, endpoint, protocol }
    }
}

impl fmt::Display for ContainerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.container, self.endpoint, self.protocol)
    }
}

impl fmt::Debug for ContainerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
