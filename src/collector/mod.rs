//! Observation collectors.
//!
//! Three variants share one contract: the replay collector drives a
//! recorded timeline, the live collector owns the portal session (capture
//! pass + per-item polling through the session cookies), and the HTTP poll
//! collector reuses a captured cookie snapshot with parallel in-flight
//! requests.
//!
//! Shared rules, enforced by the plumbing in this module:
//! - Snapshot exactly once at start, before any Update.
//! - Per tick: at most one observation per line item; Update only when the
//!   observation's signature changed; exactly one Heartbeat; a failed tick
//!   emits a single HttpError and no Updates.
//! - Control commands are drained and coalesced at tick boundaries; Stop
//!   subsumes everything else.

pub mod http_poll;
pub mod live;
pub mod replay;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{MonitorConfig, MAX_POLL_SECONDS, MIN_POLL_SECONDS};
use crate::events::{ControlCommand, Event, Observation};

pub use http_poll::HttpPollCollector;
pub use live::{LiveCollector, SessionCapture};
pub use replay::ReplayCollector;

/// Per-line-item change suppression.
#[derive(Default)]
pub struct ChangeTracker {
    last_sig: FxHashMap<String, String>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the observation and report whether it differs from the last
    /// one seen for its line item.
    pub fn changed(&mut self, obs: &Observation) -> bool {
        let sig = obs.signature();
        match self.last_sig.insert(obs.id_renglon.clone(), sig.clone()) {
            Some(prev) => prev != sig,
            None => true,
        }
    }
}

/// Outcome of draining the control queue at a tick boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Continue,
    /// Skip the inter-tick sleep and tick immediately.
    CaptureNow,
    Stop {
        reason: String,
    },
}

/// Drain every pending control command and fold it into the config
/// snapshot. Later commands override earlier ones; a Stop wins outright.
pub fn drain_control(
    ctrl: &mut mpsc::Receiver<ControlCommand>,
    config: &mut MonitorConfig,
) -> ControlOutcome {
    let mut outcome = ControlOutcome::Continue;
    let mut dirty = false;

    while let Ok(cmd) = ctrl.try_recv() {
        match cmd {
            ControlCommand::Stop { reason } => {
                return ControlOutcome::Stop { reason };
            }
            ControlCommand::CaptureNow => {
                outcome = ControlOutcome::CaptureNow;
            }
            ControlCommand::SetPollSeconds(secs) => {
                let clamped = secs.clamp(MIN_POLL_SECONDS, MAX_POLL_SECONDS);
                if (clamped - config.poll_seconds).abs() > f64::EPSILON {
                    config.poll_seconds = clamped;
                    dirty = true;
                }
            }
            ControlCommand::SetIntensive(enabled) => {
                if config.intensive != enabled {
                    config.intensive = enabled;
                    dirty = true;
                }
            }
            ControlCommand::SetHttpMonitorMode(enabled) => {
                if config.http_monitor_mode != enabled {
                    config.http_monitor_mode = enabled;
                    dirty = true;
                }
            }
        }
    }

    if dirty {
        config.version += 1;
        debug!(
            "[COLLECTOR] config v{}: poll={:.2}s intensive={} http_monitor={}",
            config.version, config.poll_seconds, config.intensive, config.http_monitor_mode
        );
    }
    outcome
}

/// Send an event to the engine, blocking when the queue is full
/// (backpressure on the polling rate). Returns false once the engine side
/// is gone and the collector should wind down.
pub async fn emit(out: &mpsc::Sender<Event>, event: Event) -> bool {
    out.send(event).await.is_ok()
}

/// Lift a parsed portal response into a normalized observation.
pub(crate) fn observation_from_parsed(
    id_cot: &str,
    id_renglon: &str,
    descripcion: &str,
    parsed: crate::wire::ParsedResponse,
) -> Observation {
    let finalizada = parsed.mensaje.to_lowercase().contains("finalizada");
    Observation {
        id_cot: id_cot.to_string(),
        id_renglon: id_renglon.to_string(),
        descripcion: descripcion.to_string(),
        ofertas: parsed.ofertas,
        mejor_oferta_txt: parsed.mejor_oferta_txt,
        mejor_oferta_val: parsed.mejor_oferta_val,
        oferta_min_txt: parsed.oferta_min_txt,
        oferta_min_val: parsed.oferta_min_val,
        presupuesto_txt: parsed.presupuesto_txt,
        presupuesto_val: parsed.presupuesto_val,
        mensaje: parsed.mensaje,
        hora_ultima_oferta: parsed.hora_ultima_oferta,
        finalizada,
        http_status: 200,
    }
}
