//! Shared HTTP plumbing for backend adapters and external collaborators.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm which
    /// significantly reduces latency when many concurrent requests are issued to
    /// upstream providers.  Stream reads are bounded at 300 s with a 30 s
    /// connect window.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Timeout applied to backend health probes.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied to external tool host dispatches.
pub const TOOL_HOST_TIMEOUT: Duration = Duration::from_secs(20);
