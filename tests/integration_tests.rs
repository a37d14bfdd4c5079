// tests/integration_tests.rs
// End-to-end tests for the monitor core: replay collector -> engine ->
// processed stream, plus engine-level security and derivation scenarios
// driven through the real channels against an in-memory store.

use std::sync::Arc;

use tokio::sync::mpsc;

use subasta_bot::collector::ReplayCollector;
use subasta_bot::config::{CONTROL_QUEUE_CAPACITY, RAW_QUEUE_CAPACITY};
use subasta_bot::engine::{Engine, EngineConfig};
use subasta_bot::events::{
    CapturedItem, ControlCommand, Event, HttpErrorKind, Observation, SnapshotPayload,
};
use subasta_bot::scenario::Scenario;
use subasta_bot::security::{SecurityAction, SecurityConfig, SecurityPolicy};
use subasta_bot::storage::{AuctionState, CostsRow, Store};

// ============================================================================
// HELPERS
// ============================================================================

/// One-offer portal payload in the real wire format.
fn d_payload(monto: f64, display: &str, hora: &str, min_display: &str) -> String {
    format!(
        concat!(
            r#"[{{"id_oferta_subasta":1,"id_renglon":836160,"id_proveedor":101,"#,
            r#""proveedor":"PROVEEDOR A","monto":{monto},"monto_a_mostrar":"{display}","#,
            r#""mejor_oferta":"Vigente","hora":"{hora}"}}]"#,
            "@@$ 21.696.480,0000@@{min}@@"
        ),
        monto = monto,
        display = display,
        hora = hora,
        min = min_display,
    )
}

fn renglon_entry(rid: &str, desc: &str, d: &str) -> serde_json::Value {
    serde_json::json!({
        "id_renglon": rid,
        "descripcion": desc,
        "response_json": { "d": d }
    })
}

/// Run the replay collector over a scenario and return the raw stream.
async fn run_raw(scenario_json: &str) -> Vec<Event> {
    let scenario = Scenario::from_json(scenario_json).expect("scenario should load");
    let (raw_tx, mut raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
    let (_ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

    ReplayCollector::new(scenario, raw_tx, ctrl_rx)
        .immediate()
        .run()
        .await
        .expect("replay should run");

    let mut events = Vec::new();
    while let Ok(ev) = raw_rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Run collector + engine and return the processed stream and the store.
async fn run_pipeline(scenario_json: &str) -> (Vec<Event>, Arc<Store>) {
    let scenario = Scenario::from_json(scenario_json).expect("scenario should load");
    let poll = scenario.config.tick_duration_seconds;
    let store = Arc::new(Store::open_in_memory().expect("store should open"));

    let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
    let (processed_tx, mut processed_rx) = mpsc::channel(4096);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

    let engine = Engine::new(
        store.clone(),
        raw_rx,
        processed_tx,
        ctrl_tx,
        SecurityPolicy::new(SecurityConfig::default()),
        EngineConfig::default(),
        poll,
    );
    let engine_handle = tokio::spawn(engine.run());

    ReplayCollector::new(scenario, raw_tx, ctrl_rx)
        .immediate()
        .run()
        .await
        .expect("replay should run");
    engine_handle.await.expect("engine should finish");

    let mut events = Vec::new();
    while let Ok(ev) = processed_rx.try_recv() {
        events.push(ev);
    }
    (events, store)
}

/// Engine driven by hand-fed events; keeps the control receiver so tests
/// can assert what the engine asked the collector to do.
struct EngineHarness {
    raw_tx: mpsc::Sender<Event>,
    processed_rx: mpsc::Receiver<Event>,
    ctrl_rx: mpsc::Receiver<ControlCommand>,
    store: Arc<Store>,
    handle: tokio::task::JoinHandle<()>,
}

fn spawn_engine(base_poll: f64) -> EngineHarness {
    let store = Arc::new(Store::open_in_memory().expect("store should open"));
    let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
    let (processed_tx, processed_rx) = mpsc::channel(4096);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(64);

    let engine = Engine::new(
        store.clone(),
        raw_rx,
        processed_tx,
        ctrl_tx,
        SecurityPolicy::new(SecurityConfig::default()),
        EngineConfig::default(),
        base_poll,
    );
    let handle = tokio::spawn(engine.run());

    EngineHarness {
        raw_tx,
        processed_rx,
        ctrl_rx,
        store,
        handle,
    }
}

impl EngineHarness {
    async fn send(&self, ev: Event) {
        self.raw_tx.send(ev).await.expect("engine should be alive");
    }

    async fn finish(mut self) -> (Vec<Event>, Arc<Store>, Vec<ControlCommand>) {
        drop(self.raw_tx);
        self.handle.await.expect("engine should finish");

        let mut processed = Vec::new();
        while let Ok(ev) = self.processed_rx.try_recv() {
            processed.push(ev);
        }
        let mut commands = Vec::new();
        while let Ok(cmd) = self.ctrl_rx.try_recv() {
            commands.push(cmd);
        }
        (processed, self.store, commands)
    }
}

/// Wait until the engine has applied the snapshot for `id_cot`.
async fn wait_for_auction(store: &Store, id_cot: &str) -> i64 {
    for _ in 0..200 {
        if let Some(row) = store.get_auction(id_cot).unwrap() {
            return row.id;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("auction {} never appeared in the store", id_cot);
}

fn snapshot(id_cot: &str, renglones: &[(&str, &str)]) -> Event {
    Event::Snapshot(SnapshotPayload {
        id_cot: id_cot.to_string(),
        url: format!("https://portal/subasta/{}", id_cot),
        margen: String::new(),
        renglones: renglones
            .iter()
            .map(|(rid, desc)| CapturedItem {
                id_renglon: rid.to_string(),
                descripcion: desc.to_string(),
                cantidad: None,
                precio_referencia: None,
                presupuesto: None,
                estado_inicial: None,
            })
            .collect(),
    })
}

fn update(id_cot: &str, rid: &str, best: Option<f64>, min: Option<f64>) -> Event {
    Event::Update(Observation {
        id_cot: id_cot.to_string(),
        id_renglon: rid.to_string(),
        descripcion: "Insumo".to_string(),
        ofertas: vec![],
        mejor_oferta_txt: best.map(|v| format!("$ {:.2}", v)).unwrap_or_default(),
        mejor_oferta_val: best,
        oferta_min_txt: min.map(|v| format!("$ {:.2}", v)).unwrap_or_default(),
        oferta_min_val: min,
        presupuesto_txt: String::new(),
        presupuesto_val: None,
        mensaje: String::new(),
        hora_ultima_oferta: None,
        finalizada: false,
        http_status: 200,
    })
}

fn http_error(id_cot: &str, status: u16, kind: HttpErrorKind, message: &str) -> Event {
    Event::HttpError {
        id_cot: id_cot.to_string(),
        id_renglon: None,
        status,
        kind,
        message: message.to_string(),
    }
}

fn heartbeat(tick: u64) -> Event {
    Event::Heartbeat {
        tick,
        elapsed_secs: tick as f64,
    }
}

fn best_values(events: &[Event]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Update(obs) => obs.mejor_oferta_val,
            _ => None,
        })
        .collect()
}

// ============================================================================
// CONTROLLED REAL RUN - one line item, price drops, two errors, finalization
// ============================================================================

mod controlled_real_run {
    use super::*;

    fn scenario() -> String {
        let steps = [
            (1, 20_115_680.0, "$ 20.115.680,0000", "10:00:01"),
            (3, 20_000_000.0, "$ 20.000.000,0000", "10:00:03"),
            (10, 19_850_000.0, "$ 19.850.000,0000", "10:00:10"),
            (14, 19_700_000.0, "$ 19.700.000,0000", "10:00:14"),
            (18, 19_600_000.0, "$ 19.600.000,0000", "10:00:18"),
        ];
        let mut timeline: Vec<serde_json::Value> = steps
            .iter()
            .map(|(tick, monto, display, hora)| {
                serde_json::json!({
                    "tick": tick,
                    "hora": hora,
                    "status": 200,
                    "renglones": [renglon_entry(
                        "836160",
                        "Insumo principal",
                        &d_payload(*monto, display, hora, "$ 20.015.101,6000"),
                    )]
                })
            })
            .collect();
        timeline.push(serde_json::json!({
            "tick": 7, "hora": "10:00:07", "status": 500, "error_message": "timeout BD"
        }));
        timeline.push(serde_json::json!({
            "tick": 16, "hora": "10:00:16", "status": 500, "error_message": "timeout BD"
        }));
        timeline.push(serde_json::json!({
            "tick": 20, "hora": "10:00:20", "status": 200,
            "event": "end_auction", "message": "Subasta finalizada"
        }));
        timeline.sort_by_key(|e| e["tick"].as_u64());

        serde_json::json!({
            "scenario_name": "controlled_real",
            "description": "subasta real controlada",
            "subasta": { "id_cot": "22053", "url": "https://portal/subasta/22053" },
            "config": { "tick_duration_seconds": 1.0, "max_ticks": 25 },
            "timeline": timeline
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_raw_stream_shape() {
        let events = run_raw(&scenario()).await;

        // Snapshot strictly first, carrying the opening observation.
        let Event::Snapshot(payload) = &events[0] else {
            panic!("snapshot must come first");
        };
        let baseline = payload.renglones[0]
            .estado_inicial
            .as_ref()
            .and_then(|o| o.mejor_oferta_val);
        assert_eq!(baseline, Some(20_115_680.0));

        // Four UPDATE events with strictly decreasing best offers.
        let bests = best_values(&events);
        assert_eq!(bests.len(), 4, "four price drops expected");
        assert_eq!(bests.first().copied(), Some(20_000_000.0));
        assert_eq!(bests.last().copied(), Some(19_600_000.0));
        assert!(bests.windows(2).all(|w| w[1] < w[0]), "bests: {:?}", bests);
        assert!(bests.iter().all(|b| *b < 20_115_680.0));

        // Two HTTP errors, one END.
        let errors = events
            .iter()
            .filter(|e| matches!(e, Event::HttpError { .. }))
            .count();
        assert_eq!(errors, 2);
        let ends = events
            .iter()
            .filter(|e| matches!(e, Event::End { .. }))
            .count();
        assert_eq!(ends, 1);

        // Exactly one heartbeat per tick, through the end tick.
        let heartbeats = events
            .iter()
            .filter(|e| matches!(e, Event::Heartbeat { .. }))
            .count();
        assert_eq!(heartbeats, 20);
    }

    #[tokio::test]
    async fn test_end_is_terminal_after_final_heartbeat() {
        let events = run_raw(&scenario()).await;

        let last_hb = events
            .iter()
            .rposition(|e| matches!(e, Event::Heartbeat { .. }))
            .expect("heartbeats expected");
        let end_pos = events
            .iter()
            .position(|e| matches!(e, Event::End { .. }))
            .expect("end expected");

        // END comes right after its tick's heartbeat, and nothing ticks
        // afterwards.
        assert_eq!(end_pos, last_hb + 1);
        assert!(events[end_pos + 1..]
            .iter()
            .all(|e| !matches!(e, Event::Update(_) | Event::Heartbeat { .. })));
    }

    #[tokio::test]
    async fn test_engine_alerts_on_each_drop() {
        let (processed, store) = run_pipeline(&scenario()).await;

        let down_alerts: Vec<&Event> = processed
            .iter()
            .filter(|e| {
                matches!(e, Event::Alert { decision, .. }
                    if decision.style.to_string() == "ALERT_DOWN")
            })
            .collect();
        assert_eq!(down_alerts.len(), 4, "one ALERT_DOWN per price drop");

        // The auction finalized normally.
        let auction = store.get_auction("22053").unwrap().unwrap();
        assert_eq!(auction.estado, AuctionState::Ended);
        assert!(auction.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_engine_output_is_dedup_subsequence() {
        let raw = run_raw(&scenario()).await;
        let (processed, _) = run_pipeline(&scenario()).await;

        let raw_bests = best_values(&raw);
        let processed_bests: Vec<f64> = processed
            .iter()
            .filter_map(|e| match e {
                Event::Processed(row) => row.observation.mejor_oferta_val,
                _ => None,
            })
            .collect();

        // The collector already deduplicates, so the engine's processed
        // sequence must mirror it exactly.
        assert_eq!(processed_bests, raw_bests);
    }

    #[tokio::test]
    async fn test_state_persisted_matches_last_observation() {
        let (_, store) = run_pipeline(&scenario()).await;
        let auction = store.get_auction("22053").unwrap().unwrap();
        assert_eq!(auction.id_cot, "22053");
        assert!(store.count_events("UPDATE").unwrap() >= 4);
        assert!(store.count_events("HTTP_ERROR").unwrap() >= 2);
    }
}

// ============================================================================
// MULTI-LINE - independent changes emit exactly one UPDATE
// ============================================================================

mod multi_line_updates {
    use super::*;

    fn scenario() -> String {
        let initial: Vec<serde_json::Value> = ["836160", "836161", "836162"]
            .iter()
            .enumerate()
            .map(|(i, rid)| {
                renglon_entry(
                    rid,
                    &format!("Insumo {}", i + 1),
                    &d_payload(
                        1_000_000.0 + i as f64,
                        "$ 1.000.000,0000",
                        "09:00:00",
                        "$ 990.000,0000",
                    ),
                )
            })
            .collect();

        serde_json::json!({
            "scenario_name": "multi_line",
            "description": "tres renglones, cambios independientes",
            "subasta": { "id_cot": "22054", "url": "https://portal/subasta/22054" },
            "config": { "tick_duration_seconds": 1.0, "max_ticks": 6 },
            "timeline": [
                { "tick": 1, "hora": "09:00:00", "status": 200, "renglones": initial },
                { "tick": 2, "hora": "09:00:02", "status": 200, "renglones": [
                    renglon_entry("836161", "Insumo 2",
                        &d_payload(950_000.0, "$ 950.000,0000", "09:00:02", "$ 940.000,0000"))
                ]},
                { "tick": 4, "hora": "09:00:04", "status": 200, "renglones": [
                    renglon_entry("836162", "Insumo 3",
                        &d_payload(900_000.0, "$ 900.000,0000", "09:00:04", "$ 890.000,0000"))
                ]}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_single_update_per_changed_item() {
        let events = run_raw(&scenario()).await;

        // Updates per tick: collect bursts between heartbeats.
        let mut bursts: Vec<usize> = Vec::new();
        let mut current = 0usize;
        for ev in &events {
            match ev {
                Event::Update(_) => current += 1,
                Event::Heartbeat { .. } => {
                    bursts.push(current);
                    current = 0;
                }
                _ => {}
            }
        }

        // Tick 1 repeats the snapshot baseline. Ticks 2 and 4: exactly one
        // update each, not three. Everything else silent.
        assert_eq!(bursts[0], 0);
        assert_eq!(bursts[1], 1);
        assert_eq!(bursts[2], 0);
        assert_eq!(bursts[3], 1);
        assert!(bursts[4..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_updates_name_the_changed_item() {
        let events = run_raw(&scenario()).await;
        let rids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                Event::Update(obs) => Some(obs.id_renglon.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rids, vec!["836161".to_string(), "836162".to_string()]);
    }
}

// ============================================================================
// BACKOFF AND RECOVERY - error storm escalates to a security stop
// ============================================================================

mod error_storm_backoff {
    use super::*;

    #[tokio::test]
    async fn test_storm_backs_off_then_stops() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        for tick in 1..=10u64 {
            harness
                .send(http_error("22053", 500, HttpErrorKind::Transient, "HTTP 500"))
                .await;
            harness.send(heartbeat(tick)).await;
        }

        let (processed, store, commands) = harness.finish().await;

        // Backoff intervals are non-decreasing up to the ceiling.
        let backoffs: Vec<f64> = processed
            .iter()
            .filter_map(|e| match e {
                Event::Security {
                    action: SecurityAction::Backoff { new_poll_seconds },
                    ..
                } => Some(*new_poll_seconds),
                _ => None,
            })
            .collect();
        assert!(!backoffs.is_empty());
        assert_eq!(backoffs[0], 2.0, "first backoff doubles the base interval");
        assert!(backoffs.windows(2).all(|w| w[1] >= w[0]));
        assert!(backoffs.iter().all(|p| *p <= 30.0));

        // Exactly one security stop, and one stop command to the collector.
        let stops = processed
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::Security {
                        action: SecurityAction::Stop,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(stops, 1);
        let stop_cmds = commands
            .iter()
            .filter(|c| matches!(c, ControlCommand::Stop { .. }))
            .count();
        assert_eq!(stop_cmds, 1);

        // Auction ends in ERROR with the full streak recorded.
        let auction = store.get_auction("22053").unwrap().unwrap();
        assert_eq!(auction.estado, AuctionState::Error);
        assert!(auction.err_streak >= 10);
    }

    #[tokio::test]
    async fn test_recovery_restores_interval_and_streak() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        // Three errors trigger one backoff.
        for tick in 1..=3u64 {
            harness
                .send(http_error("22053", 500, HttpErrorKind::Transient, "HTTP 500"))
                .await;
            harness.send(heartbeat(tick)).await;
        }
        // A clean tick follows.
        harness
            .send(update("22053", "836160", Some(1_000.0), Some(990.0)))
            .await;
        harness.send(heartbeat(4)).await;

        let (_processed, store, commands) = harness.finish().await;

        let polls: Vec<f64> = commands
            .iter()
            .filter_map(|c| match c {
                ControlCommand::SetPollSeconds(s) => Some(*s),
                _ => None,
            })
            .collect();
        // Backed off to 2.0, then restored to the base 1.0.
        assert_eq!(polls, vec![2.0, 1.0]);

        let auction = store.get_auction("22053").unwrap().unwrap();
        assert_eq!(auction.estado, AuctionState::Running);
        assert_eq!(auction.err_streak, 0);
    }
}

// ============================================================================
// BIDIRECTIONAL COST - TOTAL wins, missing side computed
// ============================================================================

mod bidirectional_cost {
    use super::*;

    async fn derived_costs(
        unit: Option<f64>,
        total: Option<f64>,
        cantidad: f64,
    ) -> (Option<f64>, Option<f64>) {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        // User loads the cost row between ticks.
        let auction_pk = wait_for_auction(&harness.store, "22053").await;
        let item_pk = harness
            .store
            .upsert_line_item(auction_pk, "836160", "Insumo", None)
            .unwrap();
        harness
            .store
            .upsert_user_costs(
                item_pk,
                &CostsRow {
                    cantidad: Some(cantidad),
                    costo_unit_ars: unit,
                    costo_total_ars: total,
                    ..Default::default()
                },
                "t0",
            )
            .unwrap();

        harness
            .send(update("22053", "836160", Some(5_000.0), Some(4_900.0)))
            .await;
        harness.send(heartbeat(1)).await;

        let (processed, _, _) = harness.finish().await;
        let row = processed
            .iter()
            .find_map(|e| match e {
                Event::Processed(row) => Some(row),
                _ => None,
            })
            .expect("processed row expected");
        (row.metrics.costo_unit_ars, row.metrics.costo_total_ars)
    }

    #[tokio::test]
    async fn test_total_wins_over_inconsistent_unit() {
        // cu=100, ct=1500, eq=10 -> cu recomputed to 150
        let (unit, total) = derived_costs(Some(100.0), Some(1_500.0), 10.0).await;
        assert_eq!(unit, Some(150.0));
        assert_eq!(total, Some(1_500.0));
    }

    #[tokio::test]
    async fn test_missing_total_computed() {
        // cu=200, ct=null, eq=10 -> ct=2000
        let (unit, total) = derived_costs(Some(200.0), None, 10.0).await;
        assert_eq!(unit, Some(200.0));
        assert_eq!(total, Some(2_000.0));
    }

    #[tokio::test]
    async fn test_pair_consistent_in_store() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;
        let auction_pk = wait_for_auction(&harness.store, "22053").await;
        let item_pk = harness
            .store
            .upsert_line_item(auction_pk, "836160", "Insumo", None)
            .unwrap();
        harness
            .store
            .upsert_user_costs(
                item_pk,
                &CostsRow {
                    cantidad: Some(10.0),
                    costo_unit_ars: Some(100.0),
                    costo_total_ars: Some(1_500.0),
                    ..Default::default()
                },
                "t0",
            )
            .unwrap();
        harness
            .send(update("22053", "836160", Some(5_000.0), None))
            .await;

        let (_, store, _) = harness.finish().await;
        let rows = store.fetch_export_rows(auction_pk).unwrap();
        let (unit, total, cantidad) = (
            rows[0].costo_unit_ars.unwrap(),
            rows[0].costo_total_ars.unwrap(),
            rows[0].cantidad.unwrap(),
        );
        assert!((unit * cantidad - total).abs() <= 0.01);
    }
}

// ============================================================================
// MARGIN ROUND-TRIP - percent in, fraction stored, percent out
// ============================================================================

mod margin_roundtrip {
    use super::*;

    #[tokio::test]
    async fn test_margin_roundtrip_and_acceptable_price() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;
        let auction_pk = wait_for_auction(&harness.store, "22053").await;
        let item_pk = harness
            .store
            .upsert_line_item(auction_pk, "836160", "Insumo", None)
            .unwrap();

        // User enters 30 (percent).
        harness
            .store
            .upsert_user_costs(
                item_pk,
                &CostsRow {
                    cantidad: Some(1.0),
                    costo_unit_ars: Some(1_000_000.0),
                    renta_minima: Some(30.0),
                    ..Default::default()
                },
                "t0",
            )
            .unwrap();

        // Stored as a fraction.
        let stored = harness.store.get_costs(item_pk).unwrap().unwrap();
        assert!((stored.renta_minima.unwrap() - 0.30).abs() < 1e-9);

        harness
            .send(update("22053", "836160", Some(1_500_000.0), Some(1_400_000.0)))
            .await;
        let (_, store, _) = harness.finish().await;

        // Exported as 30; acceptable price is 1.30 x cost.
        let rows = store.fetch_export_rows(auction_pk).unwrap();
        assert!((rows[0].renta_minima_pct.unwrap() - 30.0).abs() < 1e-9);
        assert!((rows[0].precio_unit_aceptable.unwrap() - 1_300_000.0).abs() < 1e-6);

        // Re-import of the exported value lands on the same fraction.
        store
            .upsert_user_costs(
                item_pk,
                &CostsRow {
                    cantidad: Some(1.0),
                    costo_unit_ars: Some(1_000_000.0),
                    renta_minima: rows[0].renta_minima_pct,
                    ..Default::default()
                },
                "t1",
            )
            .unwrap();
        let reimported = store.get_costs(item_pk).unwrap().unwrap();
        assert!((reimported.renta_minima.unwrap() - 0.30).abs() < 1e-9);
    }
}

// ============================================================================
// SESSION EXPIRY - expiry is not an error storm
// ============================================================================

mod session_expiry {
    use super::*;

    #[tokio::test]
    async fn test_session_expiry_keeps_auction_running() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        // The collector collapses five consecutive 401s into one event.
        harness
            .send(http_error(
                "22053",
                401,
                HttpErrorKind::SessionExpired,
                "sesión expirada (5 fallos de autenticación)",
            ))
            .await;

        let (processed, store, commands) = harness.finish().await;

        // No SECURITY at all: expiry is not a storm.
        assert!(processed
            .iter()
            .all(|e| !matches!(e, Event::Security { .. })));
        assert!(commands
            .iter()
            .all(|c| !matches!(c, ControlCommand::Stop { .. })));

        // Exactly one HTTP_ERROR forwarded, and the auction stays RUNNING.
        let expired = processed
            .iter()
            .filter(|e| {
                matches!(e, Event::HttpError { kind, .. }
                    if *kind == HttpErrorKind::SessionExpired)
            })
            .count();
        assert_eq!(expired, 1);

        let auction = store.get_auction("22053").unwrap().unwrap();
        assert_eq!(auction.estado, AuctionState::Running);
    }
}

// ============================================================================
// LEADERSHIP - winner and loser styles from the offer book
// ============================================================================

mod leadership {
    use super::*;
    use subasta_bot::wire::Offer;

    fn offer(id_proveedor: i64, monto: f64, label: &str, hora: &str) -> Offer {
        Offer {
            id_oferta_subasta: Some(1),
            id_renglon: Some(836160),
            id_proveedor: Some(id_proveedor),
            proveedor: format!("PROV {}", id_proveedor),
            monto,
            monto_a_mostrar: format!("$ {:.2}", monto),
            mejor_oferta: label.to_string(),
            hora: hora.to_string(),
        }
    }

    fn update_with_offers(best: f64, ofertas: Vec<Offer>) -> Event {
        let Event::Update(mut obs) = update("22053", "836160", Some(best), Some(best - 10.0))
        else {
            unreachable!()
        };
        obs.ofertas = ofertas;
        Event::Update(obs)
    }

    #[tokio::test]
    async fn test_winner_then_loser_latch() {
        let harness = spawn_engine(1.0);
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        // The user registered their provider id for this auction.
        let auction_pk = wait_for_auction(&harness.store, "22053").await;
        harness
            .store
            .set_mi_id_proveedor(auction_pk, Some("555"))
            .unwrap();

        // Engine caches mi_id_proveedor at snapshot time; re-snapshot to
        // pick up the fresh value the way a restart would.
        harness.send(snapshot("22053", &[("836160", "Insumo")])).await;

        // Our offer leads.
        harness
            .send(update_with_offers(
                1_000.0,
                vec![offer(555, 1_000.0, "Vigente", "10:00:00")],
            ))
            .await;
        // A rival takes the lead.
        harness
            .send(update_with_offers(
                990.0,
                vec![
                    offer(777, 990.0, "Vigente", "10:01:00"),
                    offer(555, 1_000.0, "Superada", "10:00:00"),
                ],
            ))
            .await;

        let (processed, _, _) = harness.finish().await;

        let styles: Vec<String> = processed
            .iter()
            .filter_map(|e| match e {
                Event::Processed(row) => Some(row.decision.style.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(styles, vec!["WINNER".to_string(), "LOSER".to_string()]);
    }
}

// ============================================================================
// DETERMINISM AND LIFECYCLE PROPERTIES
// ============================================================================

mod properties {
    use super::*;

    fn simple_scenario() -> String {
        serde_json::json!({
            "scenario_name": "simple",
            "description": "determinismo",
            "subasta": { "id_cot": "31000", "url": "https://portal/subasta/31000" },
            "config": { "tick_duration_seconds": 0.5, "max_ticks": 5 },
            "timeline": [
                { "tick": 1, "hora": "10:00:00", "status": 200, "renglones": [
                    renglon_entry("900001", "Item",
                        &d_payload(500.0, "$ 500,00", "10:00:00", "$ 495,00"))
                ]},
                { "tick": 3, "hora": "10:00:01", "status": 200, "renglones": [
                    renglon_entry("900001", "Item",
                        &d_payload(480.0, "$ 480,00", "10:00:01", "$ 475,00"))
                ]}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_replay_streams_are_identical() {
        let a = run_raw(&simple_scenario()).await;
        let b = run_raw(&simple_scenario()).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_stop_releases_pipeline() {
        let scenario = Scenario::from_json(&simple_scenario()).unwrap();
        let (raw_tx, mut raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

        ctrl_tx
            .send(ControlCommand::Stop {
                reason: "apagado".into(),
            })
            .await
            .unwrap();

        let handle = tokio::spawn(
            ReplayCollector::new(scenario, raw_tx, ctrl_rx)
                .immediate()
                .run(),
        );
        handle.await.unwrap().unwrap();

        // The collector drained and closed its side: the stream ends with
        // the Stop marker and the channel disconnects (handles released).
        let mut last = None;
        while let Ok(ev) = raw_rx.try_recv() {
            last = Some(ev);
        }
        assert!(matches!(last, Some(Event::Stop { .. })));
        assert!(raw_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_resets_before_updates_reach_engine() {
        // Engine refuses updates for auctions it never snapshotted.
        let harness = spawn_engine(1.0);
        harness
            .send(update("99999", "836160", Some(1.0), None))
            .await;
        let (processed, store, _) = harness.finish().await;
        assert!(processed
            .iter()
            .all(|e| !matches!(e, Event::Processed(_))));
        assert!(store.get_auction("99999").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parse_failure_is_not_an_http_error() {
        // A malformed payload in a live tick degrades to a WARN log, never
        // an HttpError; scenario validation rejects it up front instead.
        let bad = serde_json::json!({
            "scenario_name": "bad",
            "description": "payload roto",
            "subasta": { "id_cot": "1", "url": "u" },
            "config": { "tick_duration_seconds": 1.0, "max_ticks": 2 },
            "timeline": [
                { "tick": 1, "hora": "10:00:00", "status": 200, "renglones": [
                    renglon_entry("1", "x", "no-separators")
                ]}
            ]
        });
        assert!(Scenario::from_json(&bad.to_string()).is_err());
    }
}
