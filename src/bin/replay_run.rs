//! Scenario debugging tool: plays a recorded timeline through the full
//! collector + engine pipeline against an in-memory store and prints the
//! processed event stream.
//!
//! Usage: replay_run <escenario.json>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use subasta_bot::collector::ReplayCollector;
use subasta_bot::config::{
    CONTROL_QUEUE_CAPACITY, PROCESSED_QUEUE_CAPACITY, RAW_QUEUE_CAPACITY,
};
use subasta_bot::engine::{Engine, EngineConfig};
use subasta_bot::events::Event;
use subasta_bot::scenario::Scenario;
use subasta_bot::security::{SecurityConfig, SecurityPolicy};
use subasta_bot::storage::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .context("uso: replay_run <escenario.json>")?;
    let scenario = Scenario::load(&PathBuf::from(&path))?;
    let poll = scenario.config.tick_duration_seconds;

    println!(
        "Escenario: {} ({} entradas, id_cot={})",
        scenario.scenario_name,
        scenario.timeline.len(),
        scenario.subasta.id_cot
    );

    let store = Arc::new(Store::open_in_memory()?);
    let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
    let (processed_tx, mut processed_rx) = mpsc::channel(PROCESSED_QUEUE_CAPACITY);
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

    let collector = ReplayCollector::new(scenario, raw_tx, ctrl_rx).immediate();
    let collector_handle = tokio::spawn(collector.run());

    let mut updates = 0u32;
    let mut alerts = 0u32;
    while let Some(ev) = processed_rx.recv().await {
        match ev {
            Event::Start { id_cot, started_at } => {
                println!("START  {} @ {}", id_cot, started_at);
            }
            Event::Processed(row) => {
                updates += 1;
                println!(
                    "UPDATE {} mejor={} min={} estilo={}",
                    row.observation.id_renglon,
                    row.observation.mejor_oferta_txt,
                    row.observation.oferta_min_txt,
                    row.decision.style
                );
            }
            Event::Alert { id_renglon, decision } => {
                alerts += 1;
                println!("ALERT  {} {} {}", id_renglon, decision.style, decision.message);
            }
            Event::HttpError { status, message, .. } => {
                println!("HTTP_ERROR {} {}", status, message);
            }
            Event::Security { action, message } => {
                println!("SECURITY {:?} ({})", action, message);
            }
            Event::End { id_cot, id_renglon } => {
                println!("END    {} {:?}", id_cot, id_renglon);
            }
            Event::Log { level, text } => println!("LOG    [{}] {}", level, text),
            Event::Stop { reason, .. } => println!("STOP   {}", reason),
            _ => {}
        }
    }

    let _ = collector_handle.await;
    let _ = engine_handle.await;

    println!("---");
    println!(
        "updates={} alertas={} eventos_persistidos={}",
        updates,
        alerts,
        store.count_events("UPDATE").unwrap_or(0)
    );
    Ok(())
}
