use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{AgentError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| AgentError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| AgentError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    cfg.aggregator()?;

    if cfg.scrape.interval_secs == 0 {
        return Err(AgentError::Config(
            "scrape.interval_secs must be positive".to_string(),
        ));
    }
    if cfg.stream.probe_timeout_secs == 0 {
        return Err(AgentError::Config(
            "stream.probe_timeout_secs must be positive".to_string(),
        ));
    }

    Ok(())
}
