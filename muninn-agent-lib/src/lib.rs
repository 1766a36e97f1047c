#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod net;
pub mod notifier;
pub mod runtime;
pub mod scraper;
pub mod tracker;

pub use config::{load_from_path, Config};
pub use error::{AgentError, Result};
pub use net::{
    Address, Connection, ContainerEndpoint, ContainerId, Endpoint, Family, HostPort, IpNetwork,
    L4Proto, NetworkTree,
};
pub use notifier::transport::FramedTcpClient;
pub use notifier::NetworkStatusNotifier;
pub use runtime::{now_micros, StoppableWorker};
pub use scraper::{ProcfsScraper, ScrapeResult, Scraper};
pub use tracker::{ConnMap, ConnStatus, ConnectionTracker, EndpointMap};
