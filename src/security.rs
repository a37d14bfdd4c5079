//! Operational security policy for the monitor.
//!
//! Decides, from observed metrics only, whether the collector should keep
//! going, slow down (backoff) or stop. Pure: no I/O, no clocks, no queues.
//! The engine feeds it the current streak and poll interval and applies the
//! returned action.

use serde::{Deserialize, Serialize};

/// Policy thresholds. Read from env so operators can tune them without a
/// rebuild; the defaults are the values the monitor ships with.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Consecutive HTTP errors tolerated before a hard stop.
    pub stop_threshold: u32,

    /// Consecutive HTTP errors required before backoff kicks in.
    pub backoff_threshold: u32,

    /// Multiplier applied to the poll interval on each backoff.
    pub backoff_multiplier: f64,

    /// Ceiling for the backed-off poll interval, in seconds.
    pub max_poll_seconds: f64,

    /// When false, HTTP 0 timeouts only alert instead of degrading the
    /// global polling latency.
    pub backoff_on_http0_timeout: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            stop_threshold: 10,
            backoff_threshold: 3,
            backoff_multiplier: 2.0,
            max_poll_seconds: 30.0,
            backoff_on_http0_timeout: false,
        }
    }
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stop_threshold: std::env::var("SEC_STOP_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.stop_threshold),
            backoff_threshold: std::env::var("SEC_BACKOFF_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.backoff_threshold),
            backoff_multiplier: std::env::var("SEC_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.backoff_multiplier),
            max_poll_seconds: std::env::var("SEC_MAX_POLL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_poll_seconds),
            backoff_on_http0_timeout: std::env::var("SEC_BACKOFF_ON_TIMEOUT")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(d.backoff_on_http0_timeout),
        }
    }
}

/// Action decided by the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecurityAction {
    /// Keep going.
    None,
    /// Surface to the user, change nothing.
    Alert,
    /// Raise the poll interval to the contained value.
    Backoff { new_poll_seconds: f64 },
    /// Stop the auction definitively.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityDecision {
    pub action: SecurityAction,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    config: SecurityConfig,
}

impl SecurityPolicy {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Evaluate the current state and decide an action.
    ///
    /// `err_streak` is the count of consecutive non-200 ticks *including* the
    /// one being evaluated. `message` is the raw portal/collector message for
    /// the tick (used to detect explicit finalization and transient HTTP 0
    /// timeouts).
    pub fn evaluate(
        &self,
        current_poll_seconds: f64,
        err_streak: u32,
        http_status: u16,
        message: &str,
    ) -> SecurityDecision {
        let lower = message.to_lowercase();

        // Explicit finalization always wins.
        if lower.contains("finalizada") {
            return SecurityDecision {
                action: SecurityAction::Stop,
                message: "Subasta finalizada detectada".to_string(),
            };
        }

        if http_status != 200 {
            // HTTP 0 timeouts/aborts are usually transient network noise.
            let is_http0_timeout =
                http_status == 0 && (lower.contains("timeout") || lower.contains("abort"));
            if is_http0_timeout && !self.config.backoff_on_http0_timeout {
                return SecurityDecision {
                    action: SecurityAction::Alert,
                    message: "HTTP 0 timeout transitorio (sin backoff)".to_string(),
                };
            }

            if err_streak >= self.config.stop_threshold {
                return SecurityDecision {
                    action: SecurityAction::Stop,
                    message: format!("Demasiados errores HTTP consecutivos ({})", err_streak),
                };
            }

            if err_streak < self.config.backoff_threshold {
                return SecurityDecision {
                    action: SecurityAction::Alert,
                    message: format!(
                        "HTTP {} transitorio (streak {}/{})",
                        http_status, err_streak, self.config.backoff_threshold
                    ),
                };
            }

            let new_poll = (current_poll_seconds * self.config.backoff_multiplier)
                .min(self.config.max_poll_seconds);
            return SecurityDecision {
                action: SecurityAction::Backoff {
                    new_poll_seconds: new_poll,
                },
                message: format!("HTTP {} - aplicando backoff", http_status),
            };
        }

        SecurityDecision {
            action: SecurityAction::None,
            message: "Estado normal".to_string(),
        }
    }
}
