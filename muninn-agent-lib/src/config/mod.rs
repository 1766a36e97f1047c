mod loader;

pub use loader::load_from_path;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::net::HostPort;

/// Runtime configuration of the agent, loaded from TOML. Every knob has
/// a default; only the aggregator address is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `host:port` of the central aggregator.
    pub aggregator: String,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub afterglow: AfterglowConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn aggregator(&self) -> Result<HostPort> {
        self.aggregator
            .parse()
            .map_err(|err| AgentError::Config(format!("invalid aggregator address: {err}")))
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape.interval_secs)
    }

    pub fn afterglow_period(&self) -> Duration {
        Duration::from_secs(self.afterglow.period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.stream.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScrapeConfig {
    /// Root of the procfs tree to walk (`/host/proc` on a host-mount).
    pub proc_root: PathBuf,
    /// Seconds between scrape ticks.
    pub interval_secs: u64,
    /// Report TCP listen endpoints.
    pub listen_endpoints: bool,
    /// Also report unconnected UDP sockets as listeners.
    pub udp_listen_endpoints: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            interval_secs: 30,
            listen_endpoints: true,
            udp_listen_endpoints: false,
        }
    }
}

/// Grace period during which a connection that has just gone absent is
/// still reported active, suppressing flap storms. Zero disables it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AfterglowConfig {
    pub period_secs: u64,
}

impl Default for AfterglowConfig {
    fn default() -> Self {
        Self { period_secs: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Deadline for the pre-connect connectivity probe.
    pub probe_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { probe_timeout_secs: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_target: false }
    }
}
