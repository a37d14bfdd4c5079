//! Direct HTTP polling over a captured session.
//!
//! Drop-in replacement for the live tick loop: same events, same payloads,
//! but the requests go straight to the portal with a connection pool and a
//! bounded set of parallel in-flight tasks instead of one sequential call
//! per line item. Requires the cookie snapshot produced by the live
//! capture; when the cookies stop being accepted the loop stops and the
//! operator must recapture.
//!
//! Modes:
//! - intensive: every line item each cycle, short per-request timeout.
//! - relaxed: one line item per cycle (rotating cursor), long timeout.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use super::live::SessionCapture;
use super::{drain_control, emit, ChangeTracker, ControlOutcome};
use crate::config::{
    MonitorConfig, AUTH_FAILURES_MAX, ENDPOINT_BUSCAR_OFERTAS, PORTAL_DOMAIN,
};
use crate::events::{ControlCommand, Event, EventLevel, HttpErrorKind, Observation};
use crate::wire;

/// Why the poll loop returned.
#[derive(Debug)]
pub enum PollExit {
    Stopped(String),
    /// Cookies rejected repeatedly; recapture required.
    SessionExpired,
    Ended,
    /// Control switched HTTP-monitor mode off; the live loop resumes.
    ModeOff,
}

/// Result of one polled request.
enum PollFetch {
    Ok(wire::ParsedResponse),
    Auth(u16),
    Http(u16, HttpErrorKind, String),
    Parse(anyhow::Error),
}

pub struct HttpPollCollector {
    capture: SessionCapture,
}

impl HttpPollCollector {
    pub fn new(capture: SessionCapture) -> Self {
        Self { capture }
    }

    fn build_client(&self, config: &MonitorConfig) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        headers.insert(
            "Accept",
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("es-AR,es;q=0.9"));
        headers.insert(
            "Referer",
            HeaderValue::from_str(&self.capture.url).context("Referer inválido")?,
        );
        headers.insert(
            "Origin",
            HeaderValue::from_str(&format!("https://{}", PORTAL_DOMAIN))
                .context("Origin inválido")?,
        );
        // Cookies reused verbatim from the capture snapshot.
        headers.insert(
            "Cookie",
            HeaderValue::from_str(&self.capture.cookie_header())
                .context("cookies de sesión inválidas")?,
        );

        reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(config.concurrent_requests.min(30))
            .pool_idle_timeout(Duration::from_secs(30))
            // el portal suele presentar certificados auto-firmados
            .danger_accept_invalid_certs(true)
            .build()
            .context("no se pudo construir el cliente de polling")
    }

    /// Run the tick loop until stop/expiry/end/mode-off. `config` is the
    /// live collector's snapshot so changes persist across the hand-off.
    pub async fn run(
        &self,
        out: &mpsc::Sender<Event>,
        ctrl: &mut mpsc::Receiver<ControlCommand>,
        config: &mut MonitorConfig,
    ) -> Result<PollExit> {
        let client = self.build_client(config)?;

        let renglones = &self.capture.renglones;
        if renglones.is_empty() {
            anyhow::bail!("no hay renglones capturados para monitorear");
        }

        info!(
            "[HTTP-POLL] iniciado: id_cot={} renglones={} modo={} poll={:.2}s concurrencia={}",
            self.capture.id_cot,
            renglones.len(),
            if config.intensive { "INTENSIVA" } else { "RELAJADA" },
            config.poll_seconds,
            config.concurrent_requests
        );

        let mut tracker = ChangeTracker::new();
        let started = Instant::now();
        let mut tick: u64 = 0;
        let mut cursor: usize = 0;
        let mut auth_failures: u32 = 0;

        loop {
            tick += 1;

            let mut skip_sleep = false;
            match drain_control(ctrl, config) {
                ControlOutcome::Stop { reason } => return Ok(PollExit::Stopped(reason)),
                ControlOutcome::CaptureNow => skip_sleep = true,
                ControlOutcome::Continue => {}
            }
            if !config.http_monitor_mode {
                return Ok(PollExit::ModeOff);
            }

            let cycle_start = Instant::now();

            // Item selection per mode.
            let cycle_items: Vec<usize> = if config.intensive {
                (0..renglones.len()).collect()
            } else {
                let idx = cursor % renglones.len();
                cursor += 1;
                vec![idx]
            };

            // Bounded parallel fetches; results keyed by request order so the
            // auth-failure accounting stays deterministic.
            let semaphore = Arc::new(Semaphore::new(config.concurrent_requests));
            let mut join_set: JoinSet<(usize, PollFetch)> = JoinSet::new();
            for (order, idx) in cycle_items.iter().enumerate() {
                let client = client.clone();
                let semaphore = semaphore.clone();
                let id_cot = self.capture.id_cot.clone();
                let margen = self.capture.margen.clone();
                let item = renglones[*idx].clone();
                let timeout = config.effective_timeout();

                join_set.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    let fetch = fetch_one(&client, &id_cot, &margen, &item.id_renglon, timeout).await;
                    (order, fetch)
                });
            }

            let mut results: Vec<(usize, PollFetch)> = Vec::with_capacity(cycle_items.len());
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(entry) => results.push(entry),
                    Err(e) => warn!("[HTTP-POLL] tarea de request abortada: {}", e),
                }
            }
            results.sort_by_key(|(order, _)| *order);

            let mut tick_error: Option<(u16, HttpErrorKind, String)> = None;
            let mut observations: Vec<Observation> = Vec::new();

            for (order, fetch) in results {
                let item = &renglones[cycle_items[order]];
                match fetch {
                    PollFetch::Ok(parsed) => {
                        auth_failures = 0;
                        observations.push(super::observation_from_parsed(
                            &self.capture.id_cot,
                            &item.id_renglon,
                            &item.descripcion,
                            parsed,
                        ));
                    }
                    PollFetch::Parse(e) => {
                        warn!(
                            "[HTTP-POLL] respuesta no parseable renglon={}: {:#}",
                            item.id_renglon, e
                        );
                        let _ = emit(
                            out,
                            Event::Log {
                                level: EventLevel::Warn,
                                text: format!(
                                    "[HTTP-POLL] respuesta no parseable renglon={}",
                                    item.id_renglon
                                ),
                            },
                        )
                        .await;
                    }
                    PollFetch::Auth(status) => {
                        auth_failures += 1;
                        if auth_failures >= AUTH_FAILURES_MAX {
                            let _ = emit(
                                out,
                                Event::HttpError {
                                    id_cot: self.capture.id_cot.clone(),
                                    id_renglon: Some(item.id_renglon.clone()),
                                    status,
                                    kind: HttpErrorKind::SessionExpired,
                                    message: format!(
                                        "sesión expirada ({} fallos de autenticación)",
                                        auth_failures
                                    ),
                                },
                            )
                            .await;
                            return Ok(PollExit::SessionExpired);
                        }
                    }
                    PollFetch::Http(status, kind, message) => {
                        if tick_error.is_none() {
                            tick_error = Some((status, kind, message));
                        }
                    }
                }
            }

            match tick_error {
                Some((status, kind, message)) => {
                    if !emit(
                        out,
                        Event::HttpError {
                            id_cot: self.capture.id_cot.clone(),
                            id_renglon: None,
                            status,
                            kind,
                            message,
                        },
                    )
                    .await
                    {
                        return Ok(PollExit::Stopped("cola cerrada".into()));
                    }
                }
                None => {
                    let mut ended = false;
                    for obs in observations {
                        ended |= obs.finalizada;
                        if tracker.changed(&obs) {
                            if !emit(out, Event::Update(obs)).await {
                                return Ok(PollExit::Stopped("cola cerrada".into()));
                            }
                        }
                    }
                    if ended {
                        let _ = emit(
                            out,
                            Event::Heartbeat {
                                tick,
                                elapsed_secs: started.elapsed().as_secs_f64(),
                            },
                        )
                        .await;
                        let _ = emit(
                            out,
                            Event::End {
                                id_cot: self.capture.id_cot.clone(),
                                id_renglon: None,
                            },
                        )
                        .await;
                        return Ok(PollExit::Ended);
                    }
                }
            }

            if !emit(
                out,
                Event::Heartbeat {
                    tick,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                },
            )
            .await
            {
                return Ok(PollExit::Stopped("cola cerrada".into()));
            }

            if !skip_sleep {
                let elapsed = cycle_start.elapsed().as_secs_f64();
                let wait = (config.effective_poll_seconds() - elapsed).max(0.0);
                if wait > 0.0 {
                    sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    id_cot: &str,
    margen: &str,
    id_renglon: &str,
    timeout: Duration,
) -> PollFetch {
    let payload = serde_json::json!({
        "id_Cotizacion": id_cot,
        "id_Item_Renglon": id_renglon,
        "Margen_Minimo": margen,
    });

    let result = client
        .post(ENDPOINT_BUSCAR_OFERTAS)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return PollFetch::Http(0, HttpErrorKind::Timeout, "timeout".into());
        }
        Err(e) => {
            return PollFetch::Http(0, HttpErrorKind::Transient, format!("network: {}", e));
        }
    };

    let status = response.status().as_u16();
    if status == 401 || status == 403 {
        return PollFetch::Auth(status);
    }
    if status != 200 {
        return PollFetch::Http(status, HttpErrorKind::Transient, format!("HTTP {}", status));
    }

    match response.text().await {
        Ok(body) => match wire::parse_envelope(&body) {
            Ok(parsed) => PollFetch::Ok(parsed),
            Err(e) => PollFetch::Parse(e),
        },
        Err(e) => PollFetch::Http(0, HttpErrorKind::Transient, format!("body: {}", e)),
    }
}
