use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A `host:port` pair as configured, before any DNS resolution. The host
/// may be a name, an IPv4 address, or a bracketed IPv6 address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("missing ':' separator in {0:?}")]
    MissingSeparator(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
    #[error("invalid port in {0:?}: must be an integer in (0, 65535]")]
    InvalidPort(String),
}

impl FromStr for HostPort {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingSeparator(s.to_string()))?;
        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AddrParseError::EmptyHost(s.to_string()));
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| AddrParseError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(AddrParseError::InvalidPort(s.to_string()));
        }
        Ok(Self { host: host.to_string(), port })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses a comma-separated list of `host:port` entries. Empty elements
/// are skipped; any malformed element fails the whole list.
pub fn parse_address_list(s: &str) -> Result<Vec<HostPort>, AddrParseError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(HostPort::from_str)
        .collect()
}
