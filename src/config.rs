//! System configuration: portal endpoints, polling defaults and the
//! runtime settings snapshot carried through the control queue.

use std::time::Duration;

/// Portal host serving the public auction view.
pub const PORTAL_DOMAIN: &str = "webecommerce.cba.gov.ar";

/// Base URL of the public auction pages.
pub const PORTAL_BASE_URL: &str = "https://webecommerce.cba.gov.ar/VistaPublica";

/// XHR endpoint polled once per line item per tick.
pub const ENDPOINT_BUSCAR_OFERTAS: &str =
    "https://webecommerce.cba.gov.ar/VistaPublica/SubastaVivoAccesoPublico.aspx/BuscarOfertas";

/// Floor for the poll interval in any mode.
pub const MIN_POLL_SECONDS: f64 = 0.2;

/// Ceiling accepted from set-poll commands.
pub const MAX_POLL_SECONDS: f64 = 300.0;

/// Consecutive 401/403 responses before the session is declared expired.
pub const AUTH_FAILURES_MAX: u32 = 5;

/// Bounded queue capacities. Full queues block the producer (backpressure)
/// rather than dropping data.
pub const RAW_QUEUE_CAPACITY: usize = 256;
pub const PROCESSED_QUEUE_CAPACITY: usize = 256;
pub const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Versioned runtime settings for a collector. A new snapshot (with a
/// bumped `version`) is applied at the next tick boundary; mid-tick work
/// keeps the snapshot it started with.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub version: u64,
    /// Base interval between ticks, seconds.
    pub poll_seconds: f64,
    /// Intensive: all line items per cycle with the short timeout.
    /// Relaxed: one line item per cycle with the long timeout.
    pub intensive: bool,
    /// Hand the tick loop from the live session to the HTTP poll monitor.
    pub http_monitor_mode: bool,
    /// Parallel in-flight requests in the poll variant.
    pub concurrent_requests: usize,
    pub request_timeout: Duration,
    pub relaxed_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            version: 0,
            poll_seconds: 1.0,
            intensive: true,
            http_monitor_mode: false,
            concurrent_requests: 5,
            request_timeout: Duration::from_millis(2500),
            relaxed_timeout: Duration::from_millis(5000),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            version: 0,
            poll_seconds: env_f64("POLL_SECONDS", d.poll_seconds),
            intensive: env_bool("INTENSIVE_MODE", d.intensive),
            http_monitor_mode: env_bool("HTTP_MONITOR_MODE", d.http_monitor_mode),
            concurrent_requests: env_f64("CONCURRENT_REQUESTS", d.concurrent_requests as f64)
                .clamp(1.0, 30.0) as usize,
            request_timeout: d.request_timeout,
            relaxed_timeout: d.relaxed_timeout,
        }
        .clamped()
    }

    /// Clamp the poll interval into its accepted band.
    pub fn clamped(mut self) -> Self {
        self.poll_seconds = self.poll_seconds.clamp(MIN_POLL_SECONDS, MAX_POLL_SECONDS);
        self
    }

    /// Effective per-request timeout for the current mode.
    pub fn effective_timeout(&self) -> Duration {
        if self.intensive {
            self.request_timeout
        } else {
            self.relaxed_timeout
        }
    }

    /// Effective inter-tick interval for the current mode. Relaxed mode
    /// never spins below one second.
    pub fn effective_poll_seconds(&self) -> f64 {
        if self.intensive {
            self.poll_seconds
        } else {
            self.poll_seconds.max(1.0)
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}
