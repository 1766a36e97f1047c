use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::net::HostPort;

/// Result of one connectivity probe.
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable(String),
    Interrupted,
}

/// Probes TCP connectivity to `target`: resolve, connect, all under one
/// deadline, racing the stop signal. Never blocks past `timeout`.
pub async fn check_connectivity(
    target: &HostPort,
    timeout: Duration,
    stop: &CancellationToken,
) -> ProbeOutcome {
    let attempt = async {
        match tokio::time::timeout(
            timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => ProbeOutcome::Reachable,
            Ok(Err(err)) => ProbeOutcome::Unreachable(err.to_string()),
            Err(_) => ProbeOutcome::Unreachable(format!("timed out after {timeout:?}")),
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = stop.cancelled() => ProbeOutcome::Interrupted,
        outcome = attempt => outcome,
    };
    if let ProbeOutcome::Unreachable(ref reason) = outcome {
        debug!(target = %target, reason, "connectivity probe failed");
    }
    outcome
}
