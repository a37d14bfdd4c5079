//! Timeline-driven replay collector.
//!
//! Plays a recorded scenario tick by tick. Tick `n` reproduces whatever the
//! timeline entry with the largest index <= n dictates, so gaps repeat the
//! last recorded state and the change tracker suppresses them into silence.
//! Two runs over the same scenario produce identical event streams; the
//! heartbeat clock is simulated (tick x tick_duration), not wall time.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use super::{drain_control, emit, ChangeTracker, ControlOutcome};
use crate::config::MonitorConfig;
use crate::events::{
    CapturedItem, ControlCommand, Event, EventLevel, HttpErrorKind, Observation, SnapshotPayload,
};
use crate::scenario::{Scenario, TimelineEntry};
use crate::wire;

pub struct ReplayCollector {
    scenario: Scenario,
    out: mpsc::Sender<Event>,
    ctrl: mpsc::Receiver<ControlCommand>,
    config: MonitorConfig,
    /// When false, ticks run back-to-back without sleeping (tests, batch
    /// replays). The emitted stream is identical either way.
    real_time: bool,
}

impl ReplayCollector {
    pub fn new(
        scenario: Scenario,
        out: mpsc::Sender<Event>,
        ctrl: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        let config = MonitorConfig {
            poll_seconds: scenario.config.tick_duration_seconds,
            ..MonitorConfig::default()
        }
        .clamped();
        Self {
            scenario,
            out,
            ctrl,
            config,
            real_time: true,
        }
    }

    /// Disable inter-tick sleeps; used by tests and the replay runner.
    pub fn immediate(mut self) -> Self {
        self.real_time = false;
        self
    }

    /// Distinct line items in order of first appearance, each carrying the
    /// observation its first recorded response dictates. The snapshot is
    /// the baseline: a tick that reproduces it emits nothing.
    fn captured_items(&self) -> Vec<CapturedItem> {
        let mut items: Vec<CapturedItem> = Vec::new();
        for entry in &self.scenario.timeline {
            let Some(renglones) = &entry.renglones else {
                continue;
            };
            for r in renglones {
                if items.iter().any(|it| it.id_renglon == r.id_renglon) {
                    continue;
                }
                let parsed = match wire::parse_d_field(&r.response_json.d) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let presupuesto = parsed.presupuesto_val;
                let mut estado = super::observation_from_parsed(
                    &self.scenario.subasta.id_cot,
                    &r.id_renglon,
                    &r.descripcion,
                    parsed,
                );
                // Same message fallback the tick loop applies, so the
                // baseline signature matches the first tick exactly.
                if estado.mensaje.is_empty() {
                    if let Some(msg) = &entry.message {
                        estado.mensaje = msg.clone();
                        estado.finalizada = mensaje_finalizada(msg);
                    }
                }
                items.push(CapturedItem {
                    id_renglon: r.id_renglon.clone(),
                    descripcion: r.descripcion.clone(),
                    cantidad: None,
                    precio_referencia: presupuesto,
                    presupuesto,
                    estado_inicial: Some(estado),
                });
            }
        }
        items
    }

    fn build_observations(&self, entry: &TimelineEntry) -> Vec<Observation> {
        let Some(renglones) = &entry.renglones else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(renglones.len());
        for r in renglones {
            let parsed = match wire::parse_d_field(&r.response_json.d) {
                Ok(p) => p,
                // Validated at load time; a failure here means the scenario
                // mutated underneath us. Skip the item, keep the tick.
                Err(e) => {
                    warn!("[REPLAY] payload inválido renglon={}: {:#}", r.id_renglon, e);
                    continue;
                }
            };

            let mut obs = super::observation_from_parsed(
                &self.scenario.subasta.id_cot,
                &r.id_renglon,
                &r.descripcion,
                parsed,
            );
            if obs.mensaje.is_empty() {
                if let Some(msg) = &entry.message {
                    obs.mensaje = msg.clone();
                    obs.finalizada = mensaje_finalizada(msg);
                }
            }
            out.push(obs);
        }
        out
    }

    pub async fn run(mut self) -> Result<()> {
        let id_cot = self.scenario.subasta.id_cot.clone();
        info!(
            "[REPLAY] escenario '{}' id_cot={} max_ticks={}",
            self.scenario.scenario_name, id_cot, self.scenario.config.max_ticks
        );

        let items = self.captured_items();

        // The snapshot is the baseline: seed the tracker with it so the
        // first tick only emits real movement.
        let mut tracker = ChangeTracker::new();
        for item in &items {
            if let Some(obs) = &item.estado_inicial {
                tracker.changed(obs);
            }
        }

        let snapshot = SnapshotPayload {
            id_cot: id_cot.clone(),
            url: self.scenario.subasta.url.clone(),
            margen: String::new(),
            renglones: items,
        };
        if !emit(&self.out, Event::Snapshot(snapshot)).await {
            return Ok(());
        }
        let tick_duration = self.scenario.config.tick_duration_seconds;
        let max_ticks = self.scenario.config.max_ticks;

        let mut tick: u64 = 0;
        'ticks: while tick < max_ticks {
            tick += 1;

            let outcome = drain_control(&mut self.ctrl, &mut self.config);
            let skip_sleep = match outcome {
                ControlOutcome::Stop { reason } => {
                    let _ = emit(
                        &self.out,
                        Event::Stop {
                            id_cot: id_cot.clone(),
                            reason,
                        },
                    )
                    .await;
                    return Ok(());
                }
                ControlOutcome::CaptureNow => true,
                ControlOutcome::Continue => false,
            };

            let elapsed_secs = tick as f64 * tick_duration;

            if let Some(entry) = self.scenario.entry_for_tick(tick) {
                // The error applies only on the recorded tick itself; gap
                // ticks after it fall back to the last OK state.
                let erroring = entry.status != 200 && entry.tick == tick;
                let ended = entry.event.as_deref() == Some("end_auction") && entry.tick == tick;

                if erroring {
                    let message = entry
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("HTTP {}", entry.status));
                    if !emit(
                        &self.out,
                        Event::HttpError {
                            id_cot: id_cot.clone(),
                            id_renglon: None,
                            status: entry.status,
                            kind: HttpErrorKind::Transient,
                            message,
                        },
                    )
                    .await
                    {
                        return Ok(());
                    }
                } else if !ended {
                    // Gap after an error entry, or a bare no-data entry:
                    // repeat the newest OK state (the tracker silences it).
                    let governing = if entry.status != 200 || entry.renglones.is_none() {
                        self.last_ok_entry(tick)
                    } else {
                        Some(entry)
                    };

                    if let Some(entry) = governing {
                        for obs in self.build_observations(entry) {
                            if tracker.changed(&obs) {
                                if !emit(&self.out, Event::Update(obs)).await {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }

                if !emit(
                    &self.out,
                    Event::Heartbeat { tick, elapsed_secs },
                )
                .await
                {
                    return Ok(());
                }

                if ended {
                    let _ = emit(
                        &self.out,
                        Event::End {
                            id_cot: id_cot.clone(),
                            id_renglon: None,
                        },
                    )
                    .await;
                    break 'ticks;
                }
            } else {
                // Before the first recorded tick: heartbeat only.
                if !emit(
                    &self.out,
                    Event::Heartbeat { tick, elapsed_secs },
                )
                .await
                {
                    return Ok(());
                }
            }

            if self.real_time && !skip_sleep {
                sleep(Duration::from_secs_f64(self.config.poll_seconds)).await;
            }
        }

        let _ = emit(
            &self.out,
            Event::Log {
                level: EventLevel::Info,
                text: format!("[REPLAY] escenario completado (ticks={})", tick),
            },
        )
        .await;
        let _ = emit(
            &self.out,
            Event::Stop {
                id_cot,
                reason: "replay completado".to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Newest entry at or before `tick` that carries OK data.
    fn last_ok_entry(&self, tick: u64) -> Option<&TimelineEntry> {
        self.scenario
            .timeline
            .iter()
            .rev()
            .find(|e| e.tick <= tick && e.status == 200 && e.renglones.is_some())
    }
}

fn mensaje_finalizada(mensaje: &str) -> bool {
    mensaje.to_lowercase().contains("finalizada")
}
