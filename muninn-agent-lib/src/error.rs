use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Address error: {0}")]
    Address(#[from] crate::net::parse::AddrParseError),

    #[error("Scrape error: {0}")]
    Scrape(#[from] crate::scraper::ScrapeError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
