//! Event contract between collector, engine and presentation layer.
//!
//! Events are value types with a closed variant set. The raw queue
//! (collector -> engine) and the processed queue (engine -> UI) carry the
//! same `Event` enum; each stage only emits the variants it owns. Control
//! flows the other way through [`ControlCommand`].

use serde::{Deserialize, Serialize};

use crate::alerts::AlertDecision;
use crate::metrics::DerivedMetrics;
use crate::security::SecurityAction;
use crate::wire::Offer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Classification of a collector-side HTTP failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpErrorKind {
    /// Single non-2xx; counted, not escalated by itself.
    Transient,
    /// Per-request timeout expired.
    Timeout,
    /// 401/403 that has not yet reached the expiry threshold.
    Auth,
    /// The captured cookies are no longer accepted; recapture required.
    SessionExpired,
}

/// One normalized per-line-item observation produced by a collector tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id_cot: String,
    pub id_renglon: String,
    pub descripcion: String,
    pub ofertas: Vec<Offer>,
    pub mejor_oferta_txt: String,
    pub mejor_oferta_val: Option<f64>,
    pub oferta_min_txt: String,
    pub oferta_min_val: Option<f64>,
    pub presupuesto_txt: String,
    pub presupuesto_val: Option<f64>,
    pub mensaje: String,
    pub hora_ultima_oferta: Option<String>,
    pub finalizada: bool,
    /// 200 when the observation is synthetic (replay).
    pub http_status: u16,
}

impl Observation {
    /// Change signature: two observations with equal signatures are
    /// duplicates and the later one is suppressed.
    pub fn signature(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}|{}|{}",
            self.mejor_oferta_val,
            self.oferta_min_val,
            self.presupuesto_val,
            self.mensaje,
            self.finalizada
        )
    }

    /// Provider id of the currently leading offer, if any.
    pub fn leader_id_proveedor(&self) -> Option<String> {
        let leader = self
            .ofertas
            .iter()
            .find(|o| o.is_leader_label())
            .or_else(|| {
                self.ofertas.iter().min_by(|a, b| {
                    a.monto
                        .partial_cmp(&b.monto)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.hora.cmp(&b.hora))
                })
            })?;
        leader.id_proveedor.map(|id| id.to_string())
    }
}

/// One line item as seen during the capture pass (before any tick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedItem {
    pub id_renglon: String,
    pub descripcion: String,
    #[serde(default)]
    pub cantidad: Option<f64>,
    #[serde(default)]
    pub precio_referencia: Option<f64>,
    #[serde(default)]
    pub presupuesto: Option<f64>,
    /// Initial observation when the source already knows it (replay); the
    /// live capture sees the items before their first poll and leaves this
    /// empty.
    #[serde(default)]
    pub estado_inicial: Option<Observation>,
}

/// Full capture emitted once at collector start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub id_cot: String,
    pub url: String,
    /// Raw minimum-margin text as shown by the portal.
    pub margen: String,
    pub renglones: Vec<CapturedItem>,
}

/// Observation enriched by the engine with derived metrics and the alert
/// decision, already persisted when emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRow {
    pub observation: Observation,
    pub changed: bool,
    pub metrics: DerivedMetrics,
    pub decision: AlertDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start {
        id_cot: String,
        started_at: String,
    },
    Stop {
        id_cot: String,
        reason: String,
    },
    End {
        id_cot: String,
        id_renglon: Option<String>,
    },
    Snapshot(SnapshotPayload),
    Update(Observation),
    Processed(Box<ProcessedRow>),
    Heartbeat {
        tick: u64,
        elapsed_secs: f64,
    },
    HttpError {
        id_cot: String,
        id_renglon: Option<String>,
        status: u16,
        kind: HttpErrorKind,
        message: String,
    },
    Alert {
        id_renglon: String,
        decision: AlertDecision,
    },
    Security {
        action: SecurityAction,
        message: String,
    },
    Log {
        level: EventLevel,
        text: String,
    },
}

impl Event {
    /// Stable type tag used in the persistent event log.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start { .. } => "START",
            Event::Stop { .. } => "STOP",
            Event::End { .. } => "END",
            Event::Snapshot(_) => "SNAPSHOT",
            Event::Update(_) => "UPDATE",
            Event::Processed(_) => "UPDATE",
            Event::Heartbeat { .. } => "HEARTBEAT",
            Event::HttpError { .. } => "HTTP_ERROR",
            Event::Alert { .. } => "ALERT",
            Event::Security { .. } => "SECURITY",
            Event::Log { .. } => "LOG",
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            Event::HttpError { .. } => EventLevel::Warn,
            Event::Security { .. } => EventLevel::Warn,
            Event::Log { level, .. } => *level,
            _ => EventLevel::Info,
        }
    }
}

/// Commands flowing UI/engine -> collector through the control queue.
///
/// The queue is small and coalesced: the collector drains everything
/// pending at each tick boundary, keeps only the latest of each setting,
/// and lets `Stop` subsume everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Stop { reason: String },
    CaptureNow,
    SetPollSeconds(f64),
    SetIntensive(bool),
    SetHttpMonitorMode(bool),
}
