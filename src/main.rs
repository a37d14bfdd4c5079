//! Auction monitor entry point.
//!
//! Wires the data plane: collector task -> raw queue -> engine task ->
//! processed queue -> UI drain. The collector variant is chosen at startup:
//! a scenario file (`SCENARIO=path` or first argument ending in `.json`)
//! runs the deterministic replay; an auction URL runs the live session,
//! optionally handing the tick loop to the HTTP poll monitor.

mod alerts;
mod collector;
mod config;
mod engine;
mod events;
mod metrics;
mod money;
mod scenario;
mod security;
mod storage;
mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use collector::{LiveCollector, ReplayCollector};
use config::{
    MonitorConfig, CONTROL_QUEUE_CAPACITY, PROCESSED_QUEUE_CAPACITY, RAW_QUEUE_CAPACITY,
};
use engine::{Engine, EngineConfig};
use events::{Event, EventLevel};
use scenario::Scenario;
use security::{SecurityConfig, SecurityPolicy};
use storage::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subasta_bot=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let monitor_config = MonitorConfig::from_env();
    let security_config = SecurityConfig::from_env();

    info!("🛰  Monitor de subastas v2.0");
    info!(
        "   poll={:.2}s intensiva={} http_monitor={}",
        monitor_config.poll_seconds, monitor_config.intensive, monitor_config.http_monitor_mode
    );
    info!(
        "   seguridad: backoff>={} stop>={} x{:.1} tope={:.0}s",
        security_config.backoff_threshold,
        security_config.stop_threshold,
        security_config.backoff_multiplier,
        security_config.max_poll_seconds
    );

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "data/subasta.db".to_string());
    let store = match Store::open(&PathBuf::from(&db_path)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            // Corrupt/unreachable store: refuse to enter the tick loop.
            error!("[MAIN] base de datos inutilizable (categoria=store): {}", e);
            return Err(e).context("no se pudo abrir la base de datos");
        }
    };
    info!("[MAIN] base de datos: {}", db_path);

    // Collector selection: scenario file => replay; URL => live session.
    enum Target {
        Replay(Scenario),
        Live(String),
    }
    let target = match std::env::var("SCENARIO")
        .ok()
        .or_else(|| std::env::args().nth(1))
    {
        Some(path) if path.ends_with(".json") => {
            let scenario = match Scenario::load(&PathBuf::from(&path)) {
                Ok(s) => s,
                Err(e) => {
                    error!("[MAIN] escenario inutilizable (categoria=scenario): {:#}", e);
                    return Err(e);
                }
            };
            info!(
                "[MAIN] replay: '{}' ({} entradas)",
                scenario.scenario_name,
                scenario.timeline.len()
            );
            Target::Replay(scenario)
        }
        Some(url) => {
            info!("[MAIN] sesión en vivo: {}", url);
            Target::Live(url)
        }
        None => {
            error!("[MAIN] falta el objetivo (categoria=args): pasar URL de subasta o escenario .json");
            anyhow::bail!("uso: subasta_bot <url-subasta | escenario.json>");
        }
    };

    let base_poll_seconds = match &target {
        Target::Replay(s) => s.config.tick_duration_seconds,
        Target::Live(_) => monitor_config.poll_seconds,
    };

    let (raw_tx, raw_rx) = mpsc::channel::<Event>(RAW_QUEUE_CAPACITY);
    let (processed_tx, mut processed_rx) = mpsc::channel::<Event>(PROCESSED_QUEUE_CAPACITY);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

    let engine = Engine::new(
        store,
        raw_rx,
        processed_tx,
        ctrl_tx.clone(),
        SecurityPolicy::new(security_config),
        EngineConfig::default(),
        base_poll_seconds,
    );
    let engine_handle = tokio::spawn(engine.run());

    let collector_handle = match target {
        Target::Replay(scenario) => tokio::spawn(async move {
            if let Err(e) = ReplayCollector::new(scenario, raw_tx, ctrl_rx).run().await {
                error!("[REPLAY] terminó con error: {:#}", e);
            }
        }),
        Target::Live(url) => {
            let live = LiveCollector::new(url, raw_tx, ctrl_rx, monitor_config)?;
            tokio::spawn(async move {
                if let Err(e) = live.run().await {
                    error!("[LIVE] terminó con error: {:#}", e);
                }
            })
        }
    };

    // Headless UI drain: render processed events as log lines. A desktop
    // table view consumes this same queue in the full application.
    while let Some(ev) = processed_rx.recv().await {
        match &ev {
            Event::Processed(row) => {
                info!(
                    "[UI] {} mejor={} min={} estilo={} {}",
                    row.observation.id_renglon,
                    row.observation.mejor_oferta_txt,
                    row.observation.oferta_min_txt,
                    row.decision.style,
                    if row.decision.hide { "(oculto)" } else { "" }
                );
            }
            Event::Alert { id_renglon, decision } => {
                info!(
                    "[UI] 🔔 {} {} {}",
                    id_renglon, decision.style, decision.message
                );
            }
            Event::Security { action, message } => {
                warn!("[UI] 🚨 seguridad: {:?} ({})", action, message);
            }
            Event::Log { level, text } => match level {
                EventLevel::Error => error!("[UI] {}", text),
                EventLevel::Warn => warn!("[UI] {}", text),
                _ => info!("[UI] {}", text),
            },
            Event::End { id_cot, .. } => info!("[UI] subasta {} finalizada", id_cot),
            Event::Stop { id_cot, reason } => {
                info!("[UI] monitoreo de {} detenido: {}", id_cot, reason);
            }
            _ => {}
        }
    }

    let _ = collector_handle.await;
    let _ = engine_handle.await;
    info!("[MAIN] apagado limpio");
    Ok(())
}
