//! Health-check polling (§4.2 step 5, §4.3). A small `reqwest`-based poller
//! rather than a method on [`super::ContainerController`] itself, since it
//! talks to the *workload's* HTTP port, not the container runtime API — the
//! same separation the teacher draws between its Docker-facing
//! `ContainerSettings` and its ACME HTTP client, both living in the same
//! workspace but never the same struct.

use std::time::Duration;

use tracing::{instrument, warn};

/// After this many attempts the backoff between retries stops growing.
const MAX_BACKOFF_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    pub start_delay: Duration,
    pub per_attempt_timeout: Duration,
    pub max_attempts: u32,
}

/// Polls `http://<ip>:<port><path>` until a response in `[200, 400)` is
/// seen or `opts.max_attempts` is exhausted. Any network error, timeout, or
/// status `>= 400` counts as a failed attempt and is retried with backoff
/// `1s, 2s, 4s, ...` capped at [`MAX_BACKOFF_SECS`].
#[instrument(skip(opts), fields(ip, port, path))]
pub async fn wait_until_healthy(
    ip: &str,
    port: u16,
    path: &str,
    opts: &HealthCheckOptions,
) -> bool {
    tokio::time::sleep(opts.start_delay).await;

    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build health-check HTTP client");
            return false;
        }
    };
    let url = format!("http://{ip}:{port}{path}");

    for attempt in 0..opts.max_attempts {
        let outcome = client
            .get(&url)
            .timeout(opts.per_attempt_timeout)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().as_u16() < 400 => return true,
            Ok(response) => warn!(status = %response.status(), attempt, "health check returned non-2xx/3xx"),
            Err(e) => warn!(error = %e, attempt, "health check attempt failed"),
        }

        if attempt + 1 < opts.max_attempts {
            let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS));
            tokio::time::sleep(backoff).await;
        }
    }

    false
}
