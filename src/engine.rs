//! Central runtime: consumes collector events, persists them, derives the
//! business metrics, applies the security policy and the alert rules, and
//! emits processed events toward the UI.
//!
//! One rule governs the loop: nothing is emitted for an event until its
//! store writes have committed, so the store and the event stream can never
//! disagree. A failed write is retried once; a second failure stops the
//! auction with a store-failure cut.
//!
//! Observability without spam: heartbeats are folded into periodic summary
//! logs, and runs of identical HTTP errors collapse into one log line with
//! a count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::{AlertEngine, AlertInputs, PriceDirection, RowStyle, SoundCue};
use crate::events::{
    ControlCommand, Event, EventLevel, HttpErrorKind, Observation, ProcessedRow, SnapshotPayload,
};
use crate::metrics::{self, CostInputs};
use crate::security::{SecurityAction, SecurityPolicy};
use crate::storage::{AuctionState, StateRow, Store};

/// Wall-clock ISO timestamp for persisted rows.
pub fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window for aggregated heartbeat/error summaries.
    pub agg_window: Duration,
    /// Margin threshold assumed when the user has not set one.
    pub default_renta_minima: Option<f64>,
    /// Default for the hide-below-threshold flag.
    pub default_ocultar_bajo_umbral: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agg_window: Duration::from_secs(60),
            default_renta_minima: Some(0.10),
            default_ocultar_bajo_umbral: false,
        }
    }
}

#[derive(Default)]
struct AggCounts {
    updates: u64,
    changed: u64,
    http_error: u64,
    end: u64,
}

impl AggCounts {
    fn total(&self) -> u64 {
        self.updates + self.changed + self.http_error + self.end
    }
}

struct ErrRun {
    status: u16,
    count: u32,
    since: Instant,
}

pub struct Engine {
    store: Arc<Store>,
    in_rx: mpsc::Receiver<Event>,
    out_tx: mpsc::Sender<Event>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
    config: EngineConfig,
    security: SecurityPolicy,
    alerts: AlertEngine,

    /// Poll interval the collector started with; restored after backoff.
    base_poll_seconds: f64,
    current_poll_seconds: f64,
    interval_backed_off: bool,

    auction_pk_by_cot: FxHashMap<String, i64>,
    auction_state: FxHashMap<i64, AuctionState>,
    mi_proveedor: FxHashMap<i64, Option<String>>,
    item_pk: FxHashMap<(i64, String), i64>,
    last_sig: FxHashMap<i64, String>,
    last_best: FxHashMap<i64, f64>,
    err_streak: FxHashMap<i64, u32>,
    ended_keys: FxHashSet<(i64, String)>,
    stop_sent: FxHashSet<i64>,
    warned_items: FxHashSet<i64>,

    tick_had_error: bool,
    agg: AggCounts,
    agg_last_emit: Option<Instant>,
    err_run: Option<ErrRun>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        in_rx: mpsc::Receiver<Event>,
        out_tx: mpsc::Sender<Event>,
        ctrl_tx: mpsc::Sender<ControlCommand>,
        security: SecurityPolicy,
        config: EngineConfig,
        base_poll_seconds: f64,
    ) -> Self {
        Self {
            store,
            in_rx,
            out_tx,
            ctrl_tx,
            config,
            security,
            alerts: AlertEngine::default(),
            base_poll_seconds,
            current_poll_seconds: base_poll_seconds,
            interval_backed_off: false,
            auction_pk_by_cot: FxHashMap::default(),
            auction_state: FxHashMap::default(),
            mi_proveedor: FxHashMap::default(),
            item_pk: FxHashMap::default(),
            last_sig: FxHashMap::default(),
            last_best: FxHashMap::default(),
            err_streak: FxHashMap::default(),
            ended_keys: FxHashSet::default(),
            stop_sent: FxHashSet::default(),
            warned_items: FxHashSet::default(),
            tick_had_error: false,
            agg: AggCounts::default(),
            agg_last_emit: None,
            err_run: None,
        }
    }

    /// Single-consumer loop: pull, persist, emit, until the inbound side
    /// closes or a Stop marker drains through.
    pub async fn run(mut self) {
        info!("[ENGINE] iniciado (poll base={:.2}s)", self.base_poll_seconds);
        while let Some(ev) = self.in_rx.recv().await {
            let is_stop = matches!(ev, Event::Stop { .. });
            if let Err(e) = self.handle(ev).await {
                error!("[ENGINE] detenido por fallo de almacenamiento: {:#}", e);
                break;
            }
            if is_stop {
                break;
            }
        }
        self.flush_err_run().await;
        self.flush_aggregates(true).await;
        info!("[ENGINE] finalizado");
    }

    async fn emit_ui(&self, ev: Event) {
        let _ = self.out_tx.send(ev).await;
    }

    /// Store write with one retry; a second failure escalates to a
    /// security stop and aborts the engine.
    async fn persist<T>(
        &self,
        what: &str,
        op: impl Fn(&Store) -> rusqlite::Result<T>,
    ) -> Result<T> {
        match op(&self.store) {
            Ok(v) => Ok(v),
            Err(first) => {
                error!("[ENGINE] escritura '{}' falló: {} (reintento)", what, first);
                match op(&self.store) {
                    Ok(v) => Ok(v),
                    Err(second) => {
                        self.emit_ui(Event::Security {
                            action: SecurityAction::Stop,
                            message: "store failure".to_string(),
                        })
                        .await;
                        let _ = self
                            .ctrl_tx
                            .send(ControlCommand::Stop {
                                reason: "store failure".to_string(),
                            })
                            .await;
                        Err(anyhow!(second).context(format!("store failure en '{}'", what)))
                    }
                }
            }
        }
    }

    fn resolve_auction(&self, id_cot: &str) -> Option<i64> {
        if let Some(id) = self.auction_pk_by_cot.get(id_cot) {
            return Some(*id);
        }
        // One auction per process: a lone entry resolves anything.
        if self.auction_pk_by_cot.len() == 1 {
            return self.auction_pk_by_cot.values().next().copied();
        }
        None
    }

    async fn handle(&mut self, ev: Event) -> Result<()> {
        self.persist_event_log(&ev).await?;

        match ev {
            Event::Snapshot(payload) => self.handle_snapshot(payload).await?,
            Event::Update(obs) => self.handle_update(obs).await?,
            Event::HttpError {
                id_cot,
                id_renglon,
                status,
                kind,
                message,
            } => {
                self.handle_http_error(id_cot, id_renglon, status, kind, message)
                    .await?
            }
            Event::Heartbeat { .. } => self.handle_heartbeat().await?,
            Event::End { id_cot, id_renglon } => self.handle_end(&id_cot, id_renglon).await?,
            other => self.emit_ui(other).await,
        }

        self.flush_aggregates(false).await;
        Ok(())
    }

    async fn persist_event_log(&self, ev: &Event) -> Result<()> {
        // Heartbeats would swamp the audit log; they only feed summaries.
        if matches!(ev, Event::Heartbeat { .. }) {
            return Ok(());
        }
        let (auction_id, line_item_id, mensaje) = self.event_refs(ev);
        let nivel = ev.level().to_string();
        let tipo = ev.kind().to_string();
        let created = now_iso();
        self.persist("event_log", move |store| {
            store.insert_event(
                &nivel,
                &tipo,
                auction_id,
                line_item_id,
                &mensaje,
                &created,
            )
        })
        .await
    }

    fn event_refs(&self, ev: &Event) -> (Option<i64>, Option<i64>, String) {
        match ev {
            Event::Snapshot(p) => (
                self.resolve_auction(&p.id_cot),
                None,
                format!("SNAPSHOT renglones={}", p.renglones.len()),
            ),
            Event::Update(obs) => {
                let auction = self.resolve_auction(&obs.id_cot);
                let item = auction
                    .and_then(|a| self.item_pk.get(&(a, obs.id_renglon.clone())).copied());
                (auction, item, format!("Update renglón {}", obs.id_renglon))
            }
            Event::HttpError {
                id_cot,
                id_renglon,
                status,
                message,
                ..
            } => {
                let auction = self.resolve_auction(id_cot);
                let item = auction.and_then(|a| {
                    id_renglon
                        .as_ref()
                        .and_then(|r| self.item_pk.get(&(a, r.clone())).copied())
                });
                (auction, item, format!("HTTP {} - {}", status, message))
            }
            Event::End { id_cot, id_renglon } => (
                self.resolve_auction(id_cot),
                None,
                format!(
                    "Subasta finalizada{}",
                    id_renglon
                        .as_ref()
                        .map(|r| format!(" (renglón {})", r))
                        .unwrap_or_default()
                ),
            ),
            Event::Stop { id_cot, reason } => {
                (self.resolve_auction(id_cot), None, reason.clone())
            }
            Event::Log { text, .. } => (None, None, text.clone()),
            other => (None, None, other.kind().to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // SNAPSHOT
    // -------------------------------------------------------------------------

    async fn handle_snapshot(&mut self, payload: SnapshotPayload) -> Result<()> {
        let started_at = now_iso();
        let id_cot = payload.id_cot.clone();
        let url = payload.url.clone();
        let started = started_at.clone();
        let auction_id = self
            .persist("upsert_auction", move |store| {
                store.upsert_auction(&id_cot, &url, &started)
            })
            .await?;
        self.auction_pk_by_cot
            .insert(payload.id_cot.clone(), auction_id);
        self.auction_state.insert(auction_id, AuctionState::Running);
        self.err_streak.insert(auction_id, 0);

        // The bidder's provider id survives restarts in the store.
        let id_cot = payload.id_cot.clone();
        let mi = self
            .persist("get_auction", move |store| store.get_auction(&id_cot))
            .await?
            .and_then(|row| row.mi_id_proveedor);
        self.mi_proveedor.insert(auction_id, mi);

        for item in &payload.renglones {
            let rid = item.id_renglon.clone();
            let desc = item.descripcion.clone();
            let margen = payload.margen.clone();
            let pk = self
                .persist("upsert_line_item", move |store| {
                    store.upsert_line_item(
                        auction_id,
                        &rid,
                        &desc,
                        if margen.is_empty() {
                            None
                        } else {
                            Some(margen.as_str())
                        },
                    )
                })
                .await?;
            self.item_pk
                .insert((auction_id, item.id_renglon.clone()), pk);

            if item.cantidad.is_some() || item.presupuesto.is_some() {
                let precio_ref = metrics::precio_ref_unitario(
                    item.cantidad,
                    item.precio_referencia,
                    item.presupuesto,
                );
                let cantidad = item.cantidad;
                let ts = now_iso();
                self.persist("merge_captured_refs", move |store| {
                    store.merge_captured_refs(pk, cantidad, precio_ref, &ts)
                })
                .await?;
            }

            // The snapshot baseline is persisted and seeded so the first
            // real movement is judged against it, not against nothing.
            if let Some(obs) = &item.estado_inicial {
                let state = StateRow {
                    mejor_oferta_txt: Some(obs.mejor_oferta_txt.clone()),
                    oferta_min_txt: Some(obs.oferta_min_txt.clone()),
                    presupuesto_txt: Some(obs.presupuesto_txt.clone()),
                    mejor_oferta: obs.mejor_oferta_val,
                    oferta_min: obs.oferta_min_val,
                    presupuesto: obs.presupuesto_val,
                    mensaje: Some(obs.mensaje.clone()),
                    updated_at: now_iso(),
                };
                self.persist("upsert_line_item_state", move |store| {
                    store.upsert_line_item_state(pk, &state)
                })
                .await?;
                self.last_sig.insert(pk, obs.signature());
                if let Some(best) = obs.mejor_oferta_val {
                    self.last_best.insert(pk, best);
                }
            }
        }

        self.persist("set_auction_state", move |store| {
            store.set_auction_state(auction_id, AuctionState::Running, None, None, Some(0), None)
        })
        .await?;

        info!(
            "[ENGINE] SNAPSHOT aplicado: id_cot={} renglones={}",
            payload.id_cot,
            payload.renglones.len()
        );

        self.emit_ui(Event::Start {
            id_cot: payload.id_cot.clone(),
            started_at,
        })
        .await;
        self.emit_ui(Event::Snapshot(payload)).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // UPDATE
    // -------------------------------------------------------------------------

    async fn handle_update(&mut self, obs: Observation) -> Result<()> {
        self.agg.updates += 1;

        let Some(auction_id) = self.resolve_auction(&obs.id_cot) else {
            // Observation for an auction we never snapshotted; nothing to
            // attach it to.
            return Ok(());
        };

        let key = (auction_id, obs.id_renglon.clone());
        let pk = match self.item_pk.get(&key) {
            Some(pk) => *pk,
            None => {
                let rid = obs.id_renglon.clone();
                let desc = if obs.descripcion.is_empty() {
                    "Renglón sin descripción".to_string()
                } else {
                    obs.descripcion.clone()
                };
                let pk = self
                    .persist("upsert_line_item", move |store| {
                        store.upsert_line_item(auction_id, &rid, &desc, None)
                    })
                    .await?;
                self.item_pk.insert(key, pk);
                pk
            }
        };

        let now = now_iso();
        let state = StateRow {
            mejor_oferta_txt: Some(obs.mejor_oferta_txt.clone()),
            oferta_min_txt: Some(obs.oferta_min_txt.clone()),
            presupuesto_txt: Some(obs.presupuesto_txt.clone()),
            mejor_oferta: obs.mejor_oferta_val,
            oferta_min: obs.oferta_min_val,
            presupuesto: obs.presupuesto_val,
            mensaje: Some(obs.mensaje.clone()),
            updated_at: now.clone(),
        };
        self.persist("upsert_line_item_state", move |store| {
            store.upsert_line_item_state(pk, &state)
        })
        .await?;

        // A valid observation is a success for the streak accounting.
        self.err_streak.insert(auction_id, 0);
        let ok_at = now.clone();
        let http_status = obs.http_status;
        self.persist("set_auction_state", move |store| {
            store.set_auction_state(
                auction_id,
                AuctionState::Running,
                Some(ok_at.as_str()),
                Some(http_status),
                Some(0),
                None,
            )
        })
        .await?;
        self.auction_state.insert(auction_id, AuctionState::Running);

        let sig = obs.signature();
        let changed = self.last_sig.insert(pk, sig.clone()) != Some(sig);
        if changed {
            self.agg.changed += 1;
        }

        // User costs drive the derivations; derived columns flow back into
        // the same row before anything is emitted.
        let costs = self
            .persist("get_costs", move |store| store.get_costs(pk))
            .await?
            .unwrap_or_default();

        let (_, invalid_items) = metrics::normalize_items_por_renglon(costs.items_por_renglon);
        if invalid_items && self.warned_items.insert(pk) {
            let text = format!(
                "items_por_renglon inválido en renglón {}; se asume 1",
                obs.id_renglon
            );
            warn!("[ENGINE] {}", text);
            self.emit_ui(Event::Log {
                level: EventLevel::Warn,
                text,
            })
            .await;
        }

        let inputs = CostInputs {
            cantidad: costs.cantidad,
            items_por_renglon: costs.items_por_renglon,
            conv_usd: costs.conv_usd,
            costo_unit_usd: costs.costo_unit_usd,
            costo_total_usd: costs.costo_total_usd,
            costo_unit_ars: costs.costo_unit_ars,
            costo_total_ars: costs.costo_total_ars,
            renta_minima: costs.renta_minima,
        };
        let derived = metrics::derive(&inputs, obs.oferta_min_val, obs.presupuesto_val);

        let derived_for_store = derived.clone();
        let ts = now.clone();
        self.persist("update_derived_costs", move |store| {
            store.update_derived_costs(pk, &derived_for_store, &ts)
        })
        .await?;

        // Alert decision strictly after persistence.
        let direction = match (self.last_best.get(&pk), obs.mejor_oferta_val) {
            (Some(prev), Some(cur)) if cur < *prev => PriceDirection::Down,
            (Some(prev), Some(cur)) if cur > *prev => PriceDirection::Up,
            _ => PriceDirection::Flat,
        };
        if let Some(cur) = obs.mejor_oferta_val {
            self.last_best.insert(pk, cur);
        }

        let mi = self
            .mi_proveedor
            .get(&auction_id)
            .cloned()
            .unwrap_or(None);
        let is_leader = costs.oferta_mia
            || (mi.is_some() && obs.leader_id_proveedor() == mi);
        let tracked =
            costs.seguir || costs.costo_unit_ars.is_some() || costs.costo_total_ars.is_some();

        let renta_minima = costs.renta_minima.or(self.config.default_renta_minima);
        let ocultar = costs.ocultar_bajo_umbral || self.config.default_ocultar_bajo_umbral;

        let decision = self.alerts.decide(&AlertInputs {
            id_renglon: &obs.id_renglon,
            tracked,
            is_leader,
            changed,
            direction,
            renta_para_mejorar: derived.renta_para_mejorar,
            renta_minima,
            ocultar_bajo_umbral: ocultar,
        });

        let finalizada = obs.finalizada;
        let id_cot = obs.id_cot.clone();
        let id_renglon = obs.id_renglon.clone();

        if changed {
            info!(
                "[ENGINE] CAMBIO renglón={} mejor={} min={}",
                obs.id_renglon, obs.mejor_oferta_txt, obs.oferta_min_txt
            );
            let alert_worthy =
                decision.style != RowStyle::Normal || decision.sound != SoundCue::None;
            self.emit_ui(Event::Processed(Box::new(ProcessedRow {
                observation: obs,
                changed,
                metrics: derived,
                decision: decision.clone(),
            })))
            .await;
            if alert_worthy {
                self.emit_ui(Event::Alert {
                    id_renglon: id_renglon.clone(),
                    decision,
                })
                .await;
            }
        }

        if finalizada {
            self.handle_end(&id_cot, Some(id_renglon)).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // HTTP_ERROR
    // -------------------------------------------------------------------------

    async fn handle_http_error(
        &mut self,
        id_cot: String,
        id_renglon: Option<String>,
        status: u16,
        kind: HttpErrorKind,
        message: String,
    ) -> Result<()> {
        self.agg.http_error += 1;
        self.tick_had_error = true;

        let Some(auction_id) = self.resolve_auction(&id_cot) else {
            self.emit_ui(Event::HttpError {
                id_cot,
                id_renglon,
                status,
                kind,
                message,
            })
            .await;
            return Ok(());
        };

        if kind == HttpErrorKind::SessionExpired {
            // Not a storm: the auction stays RUNNING awaiting a recapture.
            self.persist("set_auction_state", move |store| {
                store.set_auction_state(
                    auction_id,
                    AuctionState::Running,
                    None,
                    Some(status),
                    None,
                    None,
                )
            })
            .await?;
            warn!("[ENGINE] sesión expirada: {}", message);
            self.emit_ui(Event::HttpError {
                id_cot,
                id_renglon,
                status,
                kind,
                message: message.clone(),
            })
            .await;
            self.emit_ui(Event::Log {
                level: EventLevel::Warn,
                text: format!("Sesión expirada; recapturar para reanudar ({})", message),
            })
            .await;
            return Ok(());
        }

        let streak = self.err_streak.get(&auction_id).copied().unwrap_or(0) + 1;
        self.err_streak.insert(auction_id, streak);
        self.persist("set_auction_state", move |store| {
            store.set_auction_state(
                auction_id,
                AuctionState::Running,
                None,
                Some(status),
                Some(streak),
                None,
            )
        })
        .await?;

        self.track_err_run(status).await;

        let decision =
            self.security
                .evaluate(self.current_poll_seconds, streak, status, &message);

        self.emit_ui(Event::HttpError {
            id_cot,
            id_renglon,
            status,
            kind,
            message,
        })
        .await;

        match decision.action {
            SecurityAction::Backoff { new_poll_seconds } => {
                if new_poll_seconds > self.current_poll_seconds {
                    self.current_poll_seconds = new_poll_seconds;
                    self.interval_backed_off = true;
                    let _ = self
                        .ctrl_tx
                        .send(ControlCommand::SetPollSeconds(new_poll_seconds))
                        .await;
                    self.emit_ui(Event::Security {
                        action: SecurityAction::Backoff { new_poll_seconds },
                        message: decision.message,
                    })
                    .await;
                }
            }
            SecurityAction::Stop => {
                self.persist("set_auction_state", move |store| {
                    store.set_auction_state(
                        auction_id,
                        AuctionState::Error,
                        None,
                        Some(status),
                        Some(streak),
                        None,
                    )
                })
                .await?;
                self.auction_state.insert(auction_id, AuctionState::Error);
                self.emit_ui(Event::Security {
                    action: SecurityAction::Stop,
                    message: decision.message.clone(),
                })
                .await;
                if self.stop_sent.insert(auction_id) {
                    let _ = self
                        .ctrl_tx
                        .send(ControlCommand::Stop {
                            reason: decision.message,
                        })
                        .await;
                }
            }
            SecurityAction::Alert | SecurityAction::None => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // HEARTBEAT
    // -------------------------------------------------------------------------

    async fn handle_heartbeat(&mut self) -> Result<()> {
        if !self.tick_had_error {
            // A whole tick without errors: reset the streak and undo any
            // backoff.
            let reset: Vec<i64> = self
                .err_streak
                .iter()
                .filter(|(_, streak)| **streak > 0)
                .map(|(id, _)| *id)
                .collect();
            for auction_id in reset {
                self.err_streak.insert(auction_id, 0);
                self.persist("set_auction_state", move |store| {
                    store.set_auction_state(
                        auction_id,
                        AuctionState::Running,
                        None,
                        None,
                        Some(0),
                        None,
                    )
                })
                .await?;
            }

            if self.interval_backed_off {
                self.interval_backed_off = false;
                self.current_poll_seconds = self.base_poll_seconds;
                let _ = self
                    .ctrl_tx
                    .send(ControlCommand::SetPollSeconds(self.base_poll_seconds))
                    .await;
                self.emit_ui(Event::Log {
                    level: EventLevel::Info,
                    text: format!(
                        "Intervalo de polling restaurado a {:.2}s",
                        self.base_poll_seconds
                    ),
                })
                .await;
            }
            self.flush_err_run().await;
        }
        self.tick_had_error = false;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // END
    // -------------------------------------------------------------------------

    async fn handle_end(&mut self, id_cot: &str, id_renglon: Option<String>) -> Result<()> {
        self.agg.end += 1;

        let Some(auction_id) = self.resolve_auction(id_cot) else {
            self.emit_ui(Event::End {
                id_cot: id_cot.to_string(),
                id_renglon,
            })
            .await;
            return Ok(());
        };

        let key = (auction_id, id_renglon.clone().unwrap_or_default());
        if !self.ended_keys.insert(key) {
            return Ok(());
        }

        // A security cut already moved the auction to ERROR; finalization
        // must not downgrade it.
        let current = self
            .auction_state
            .get(&auction_id)
            .copied()
            .unwrap_or(AuctionState::Running);
        if current != AuctionState::Error {
            let ended_at = now_iso();
            self.persist("set_auction_state", move |store| {
                store.set_auction_state(
                    auction_id,
                    AuctionState::Ended,
                    None,
                    None,
                    None,
                    Some(ended_at.as_str()),
                )
            })
            .await?;
            self.auction_state.insert(auction_id, AuctionState::Ended);
        }

        info!("[ENGINE] subasta {} marcada {}", id_cot, self.auction_state[&auction_id]);
        self.emit_ui(Event::End {
            id_cot: id_cot.to_string(),
            id_renglon,
        })
        .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Log aggregation
    // -------------------------------------------------------------------------

    /// Fold one more identical error into the current run, or flush the
    /// previous run and start a new one.
    async fn track_err_run(&mut self, status: u16) {
        match &mut self.err_run {
            Some(run) if run.status == status && run.since.elapsed() < self.config.agg_window => {
                run.count += 1;
            }
            _ => {
                self.flush_err_run().await;
                self.err_run = Some(ErrRun {
                    status,
                    count: 1,
                    since: Instant::now(),
                });
            }
        }
    }

    async fn flush_err_run(&mut self) {
        if let Some(run) = self.err_run.take() {
            self.emit_ui(Event::Log {
                level: EventLevel::Warn,
                text: format!("HTTP {} x{} en la ventana", run.status, run.count),
            })
            .await;
        }
    }

    async fn flush_aggregates(&mut self, force: bool) {
        if self.agg.total() == 0 {
            return;
        }
        let now = Instant::now();
        if !force {
            match self.agg_last_emit {
                None => {
                    self.agg_last_emit = Some(now);
                    return;
                }
                Some(last) if now.duration_since(last) < self.config.agg_window => return,
                Some(_) => {}
            }
        }

        let text = format!(
            "Resumen {}s | updates={} | changed={} | http_error={} | end={}",
            self.config.agg_window.as_secs(),
            self.agg.updates,
            self.agg.changed,
            self.agg.http_error,
            self.agg.end
        );
        self.emit_ui(Event::Log {
            level: EventLevel::Info,
            text,
        })
        .await;
        self.agg = AggCounts::default();
        self.agg_last_emit = Some(now);
    }
}
