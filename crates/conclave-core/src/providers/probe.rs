//! Shared HTTP plumbing for availability probes

use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::debug;

/// Upper bound on a single availability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the client used by probe requests
pub(crate) fn probe_client() -> Client {
    Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Send a probe request; any transport error or non-2xx status is "unavailable"
pub(crate) async fn probe_ok(provider: &str, request: RequestBuilder) -> bool {
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!("Probe for {} succeeded ({})", provider, response.status());
            true
        }
        Ok(response) => {
            debug!("Probe for {} returned status {}", provider, response.status());
            false
        }
        Err(e) => {
            debug!("Probe for {} failed: {}", provider, e);
            false
        }
    }
}
