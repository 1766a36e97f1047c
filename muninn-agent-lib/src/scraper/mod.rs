//! Procfs connection scraper: one pass over a `/proc`-like tree producing
//! per-container connection and listen-endpoint lists.

mod cgroup;
mod procfs;
mod tcp_table;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::net::{Connection, ContainerEndpoint};

/// The outcome of one scrape pass.
#[derive(Clone, Debug, Default)]
pub struct ScrapeResult {
    pub connections: Vec<Connection>,
    pub listen_endpoints: Vec<ContainerEndpoint>,
}

/// A completely unreadable proc root. Per-process errors never surface
/// here; they are logged and the process is skipped.
#[derive(Debug, Error)]
#[error("could not read proc root {path}: {source}")]
pub struct ScrapeError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Source of connection/endpoint snapshots. The notifier depends on this
/// trait so tests can inject scripted scrapes.
pub trait Scraper: Send + Sync {
    fn scrape(&self) -> Result<ScrapeResult, ScrapeError>;
}

/// Scraper over a procfs mount (typically `/host/proc` on a host-mount).
pub struct ProcfsScraper {
    proc_root: PathBuf,
    listen_endpoints: bool,
    udp_listeners: bool,
}

impl ProcfsScraper {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            listen_endpoints: true,
            udp_listeners: false,
        }
    }

    /// Report listen endpoints at all.
    pub fn with_listen_endpoints(mut self, enabled: bool) -> Self {
        self.listen_endpoints = enabled;
        self
    }

    /// Also report unconnected UDP sockets as listen endpoints.
    pub fn with_udp_listeners(mut self, enabled: bool) -> Self {
        self.udp_listeners = enabled;
        self
    }
}

impl Scraper for ProcfsScraper {
    fn scrape(&self) -> Result<ScrapeResult, ScrapeError> {
        let mut result =
            procfs::read_container_connections(&self.proc_root, self.udp_listeners)?;
        if !self.listen_endpoints {
            result.listen_endpoints.clear();
        }
        Ok(result)
    }
}
