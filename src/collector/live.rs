//! Live portal session collector.
//!
//! Owns the authenticated portal session: a cookie-holding HTTP client that
//! performs the capture pass over the auction page (id_cot, line-item list,
//! minimum margin, session cookies) and then polls `BuscarOfertas` once per
//! line item per tick through that same session.
//!
//! When HTTP-monitor mode is switched on, the session cookies are snapshotted
//! by value and the tick loop is handed to [`HttpPollCollector`]; the live
//! session stays untouched so the operator can keep using it, and a recapture
//! is only needed after the cookies expire.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use super::http_poll::{HttpPollCollector, PollExit};
use super::{drain_control, emit, ChangeTracker, ControlOutcome};
use crate::config::{MonitorConfig, AUTH_FAILURES_MAX, ENDPOINT_BUSCAR_OFERTAS, PORTAL_BASE_URL};
use crate::events::{
    CapturedItem, ControlCommand, Event, EventLevel, HttpErrorKind, Observation, SnapshotPayload,
};
use crate::wire;

/// Everything the capture pass extracted, including the session cookies
/// snapshotted by value for the poll variant.
#[derive(Debug, Clone)]
pub struct SessionCapture {
    pub id_cot: String,
    pub url: String,
    pub margen: String,
    pub renglones: Vec<CapturedItem>,
    pub cookies: Vec<(String, String)>,
}

impl SessionCapture {
    /// Serialize the cookie snapshot into a `Cookie:` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Outcome of a live tick loop.
enum LiveExit {
    Stopped(String),
    SessionExpired,
    Ended,
    /// Control asked for HTTP-monitor mode.
    HandOff,
}

pub struct LiveCollector {
    auction_url: String,
    out: mpsc::Sender<Event>,
    ctrl: mpsc::Receiver<ControlCommand>,
    config: MonitorConfig,
    client: reqwest::Client,
    jar: Arc<Jar>,
}

impl LiveCollector {
    pub fn new(
        auction_url: String,
        out: mpsc::Sender<Event>,
        ctrl: mpsc::Receiver<ControlCommand>,
        config: MonitorConfig,
    ) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            // el portal suele presentar certificados auto-firmados
            .danger_accept_invalid_certs(true)
            .build()
            .context("no se pudo construir el cliente HTTP de sesión")?;

        Ok(Self {
            auction_url,
            out,
            ctrl,
            config,
            client,
            jar,
        })
    }

    // -------------------------------------------------------------------------
    // Capture pass
    // -------------------------------------------------------------------------

    /// Fetch the auction page and extract everything the monitor needs.
    pub async fn capture(&self) -> Result<SessionCapture> {
        let response = self
            .client
            .get(&self.auction_url)
            .send()
            .await
            .context("no se pudo abrir la página de la subasta")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("la página de la subasta respondió HTTP {}", status);
        }
        let html = response
            .text()
            .await
            .context("no se pudo leer el HTML de la subasta")?;

        let id_cot = extract_id_cot(&html)?
            .context("no se detectó id_Cotizacion en el HTML de la subasta")?;
        let margen = extract_margen(&html)?.unwrap_or_default();
        let renglones = extract_renglones(&html)?;
        if renglones.is_empty() {
            anyhow::bail!("no cargaron los renglones (ddlItemRenglon vacío)");
        }

        let cookies = self.cookie_snapshot()?;

        info!(
            "[LIVE] captura OK: id_cot={} margen={:?} renglones={} cookies={}",
            id_cot,
            margen,
            renglones.len(),
            cookies.len()
        );

        Ok(SessionCapture {
            id_cot,
            url: self.auction_url.clone(),
            margen,
            renglones,
            cookies,
        })
    }

    /// Snapshot the session cookies by value.
    fn cookie_snapshot(&self) -> Result<Vec<(String, String)>> {
        let url: Url = PORTAL_BASE_URL
            .parse()
            .context("URL base del portal inválida")?;
        let Some(header) = self.jar.cookies(&url) else {
            return Ok(Vec::new());
        };
        let header = header
            .to_str()
            .context("cookies de sesión no representables")?
            .to_string();

        Ok(header
            .split("; ")
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self) -> Result<()> {
        let capture = match self.capture().await {
            Ok(c) => c,
            Err(e) => {
                // Fatal startup failure: refuse the tick loop, surface one
                // categorized error and yield.
                let _ = emit(
                    &self.out,
                    Event::Log {
                        level: EventLevel::Error,
                        text: format!("[LIVE] captura falló (categoria=capture): {:#}", e),
                    },
                )
                .await;
                return Err(e);
            }
        };

        if !emit(
            &self.out,
            Event::Snapshot(SnapshotPayload {
                id_cot: capture.id_cot.clone(),
                url: capture.url.clone(),
                margen: capture.margen.clone(),
                renglones: capture.renglones.clone(),
            }),
        )
        .await
        {
            return Ok(());
        }

        let mut reason = "monitoreo detenido".to_string();
        loop {
            let exit = if self.config.http_monitor_mode {
                // Hand the tick loop to the cookie-snapshot poller.
                let poll = HttpPollCollector::new(capture.clone());
                match poll.run(&self.out, &mut self.ctrl, &mut self.config).await? {
                    PollExit::Stopped(r) => LiveExit::Stopped(r),
                    PollExit::SessionExpired => LiveExit::SessionExpired,
                    PollExit::Ended => LiveExit::Ended,
                    PollExit::ModeOff => LiveExit::HandOff,
                }
            } else {
                self.tick_loop(&capture).await?
            };

            match exit {
                LiveExit::HandOff => continue,
                LiveExit::Stopped(r) => {
                    reason = r;
                    break;
                }
                LiveExit::SessionExpired => {
                    reason = "sesión expirada; recapturar para reanudar".to_string();
                    break;
                }
                LiveExit::Ended => {
                    reason = "subasta finalizada".to_string();
                    break;
                }
            }
        }

        let _ = emit(
            &self.out,
            Event::Stop {
                id_cot: capture.id_cot,
                reason,
            },
        )
        .await;
        Ok(())
    }

    /// Sequential per-item polling through the live session.
    async fn tick_loop(&mut self, capture: &SessionCapture) -> Result<LiveExit> {
        let mut tracker = ChangeTracker::new();
        let started = Instant::now();
        let mut tick: u64 = 0;
        let mut auth_failures: u32 = 0;

        loop {
            tick += 1;

            let mut skip_sleep = false;
            match drain_control(&mut self.ctrl, &mut self.config) {
                ControlOutcome::Stop { reason } => return Ok(LiveExit::Stopped(reason)),
                ControlOutcome::CaptureNow => skip_sleep = true,
                ControlOutcome::Continue => {}
            }
            if self.config.http_monitor_mode {
                return Ok(LiveExit::HandOff);
            }

            let cycle_start = Instant::now();
            let mut tick_error: Option<(u16, HttpErrorKind, String)> = None;
            let mut observations: Vec<Observation> = Vec::new();

            for item in &capture.renglones {
                match self.fetch_one(capture, item).await {
                    FetchResult::Ok(parsed) => {
                        auth_failures = 0;
                        observations.push(super::observation_from_parsed(
                            &capture.id_cot,
                            &item.id_renglon,
                            &item.descripcion,
                            parsed,
                        ));
                    }
                    FetchResult::ParseFailure(e) => {
                        // The line item keeps its previous state this tick;
                        // the others are unaffected.
                        warn!(
                            "[LIVE] respuesta no parseable renglon={}: {:#}",
                            item.id_renglon, e
                        );
                        let _ = emit(
                            &self.out,
                            Event::Log {
                                level: EventLevel::Warn,
                                text: format!(
                                    "[LIVE] respuesta no parseable renglon={}",
                                    item.id_renglon
                                ),
                            },
                        )
                        .await;
                    }
                    FetchResult::AuthFailure(status) => {
                        auth_failures += 1;
                        if auth_failures >= AUTH_FAILURES_MAX {
                            let _ = emit(
                                &self.out,
                                Event::HttpError {
                                    id_cot: capture.id_cot.clone(),
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
                            return Ok(LiveExit::SessionExpired);
                        }
                        continue;
                    }
                    FetchResult::HttpFailure(status, kind, message) => {
                        tick_error = Some((status, kind, message));
                        break;
                    }
                }
            }

            match tick_error {
                Some((status, kind, message)) => {
                    if !emit(
                        &self.out,
                        Event::HttpError {
                            id_cot: capture.id_cot.clone(),
                            id_renglon: None,
                            status,
                            kind,
                            message,
                        },
                    )
                    .await
                    {
                        return Ok(LiveExit::Stopped("cola cerrada".into()));
                    }
                }
                None => {
                    let mut ended = false;
                    for obs in observations {
                        ended |= obs.finalizada;
                        if tracker.changed(&obs) {
                            if !emit(&self.out, Event::Update(obs)).await {
                                return Ok(LiveExit::Stopped("cola cerrada".into()));
                            }
                        }
                    }
                    if ended {
                        let _ = emit(
                            &self.out,
                            Event::Heartbeat {
                                tick,
                                elapsed_secs: started.elapsed().as_secs_f64(),
                            },
                        )
                        .await;
                        let _ = emit(
                            &self.out,
                            Event::End {
                                id_cot: capture.id_cot.clone(),
                                id_renglon: None,
                            },
                        )
                        .await;
                        return Ok(LiveExit::Ended);
                    }
                }
            }

            if !emit(
                &self.out,
                Event::Heartbeat {
                    tick,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                },
            )
            .await
            {
                return Ok(LiveExit::Stopped("cola cerrada".into()));
            }

            if !skip_sleep {
                let elapsed = cycle_start.elapsed().as_secs_f64();
                let wait = (self.config.effective_poll_seconds() - elapsed).max(0.0);
                if wait > 0.0 {
                    sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }

    async fn fetch_one(&self, capture: &SessionCapture, item: &CapturedItem) -> FetchResult {
        let payload = serde_json::json!({
            "id_Cotizacion": capture.id_cot,
            "id_Item_Renglon": item.id_renglon,
            "Margen_Minimo": capture.margen,
        });

        let result = self
            .client
            .post(ENDPOINT_BUSCAR_OFERTAS)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Referer", &capture.url)
            .json(&payload)
            .timeout(self.config.effective_timeout())
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return FetchResult::HttpFailure(0, HttpErrorKind::Timeout, "timeout".into());
            }
            Err(e) => {
                return FetchResult::HttpFailure(
                    0,
                    HttpErrorKind::Transient,
                    format!("network: {}", e),
                );
            }
        };

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return FetchResult::AuthFailure(status);
        }
        if status != 200 {
            return FetchResult::HttpFailure(
                status,
                HttpErrorKind::Transient,
                format!("HTTP {}", status),
            );
        }

        match response.text().await {
            Ok(body) => match wire::parse_envelope(&body) {
                Ok(parsed) => FetchResult::Ok(parsed),
                Err(e) => FetchResult::ParseFailure(e),
            },
            Err(e) => FetchResult::HttpFailure(
                0,
                HttpErrorKind::Transient,
                format!("body: {}", e),
            ),
        }
    }
}

pub(crate) enum FetchResult {
    Ok(wire::ParsedResponse),
    ParseFailure(anyhow::Error),
    AuthFailure(u16),
    HttpFailure(u16, HttpErrorKind, String),
}

// =============================================================================
// Capture-pass extraction
// =============================================================================

/// `Cargar_Parametro("id_Cotizacion",'21941'` is the historically stable
/// marker for the auction id in the page scripts.
pub fn extract_id_cot(html: &str) -> Result<Option<String>> {
    let re = Regex::new(r#"Cargar_Parametro\(\s*"id_Cotizacion"\s*,\s*'(\d+)'"#)
        .context("regex id_Cotizacion inválida")?;
    Ok(re.captures(html).map(|c| c[1].to_string()))
}

/// Minimum-margin input as rendered into the page.
pub fn extract_margen(html: &str) -> Result<Option<String>> {
    let re = Regex::new(r#"id="txtMargenMinimo"[^>]*\bvalue="([^"]*)""#)
        .context("regex margen inválida")?;
    Ok(re.captures(html).map(|c| c[1].to_string()))
}

/// Options of the `ddlItemRenglon` select: one per line item.
pub fn extract_renglones(html: &str) -> Result<Vec<CapturedItem>> {
    let select_re = Regex::new(r#"(?s)<select[^>]*id="ddlItemRenglon".*?</select>"#)
        .context("regex select inválida")?;
    let option_re = Regex::new(r#"(?s)<option[^>]*\bvalue="([^"]+)"[^>]*>(.*?)</option>"#)
        .context("regex option inválida")?;

    let Some(select) = select_re.find(html) else {
        return Ok(Vec::new());
    };

    let mut items = Vec::new();
    for cap in option_re.captures_iter(select.as_str()) {
        let id = cap[1].trim().to_string();
        if id.is_empty() || id == "0" {
            continue;
        }
        items.push(CapturedItem {
            id_renglon: id,
            descripcion: cap[2].trim().to_string(),
            cantidad: None,
            precio_referencia: None,
            presupuesto: None,
            estado_inicial: None,
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HTML: &str = r#"
        <html><head><script>
            Cargar_Parametro("id_Cotizacion",'21941');
        </script></head>
        <body>
            <input id="txtMargenMinimo" type="text" value="0,0050" />
            <select name="ddl" id="ddlItemRenglon">
                <option value="836160">RENGLON 1 - Insumo A</option>
                <option value="836161">RENGLON 2 - Insumo B</option>
                <option value="">-- seleccionar --</option>
            </select>
        </body></html>"#;

    #[test]
    fn test_extract_id_cot() {
        assert_eq!(
            extract_id_cot(SAMPLE_HTML).unwrap().as_deref(),
            Some("21941")
        );
        assert_eq!(extract_id_cot("<html></html>").unwrap(), None);
    }

    #[test]
    fn test_extract_margen() {
        assert_eq!(
            extract_margen(SAMPLE_HTML).unwrap().as_deref(),
            Some("0,0050")
        );
        assert_eq!(extract_margen("<html></html>").unwrap(), None);
    }

    #[test]
    fn test_extract_renglones() {
        let items = extract_renglones(SAMPLE_HTML).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id_renglon, "836160");
        assert_eq!(items[0].descripcion, "RENGLON 1 - Insumo A");
        assert_eq!(items[1].id_renglon, "836161");
    }

    #[test]
    fn test_extract_renglones_no_select() {
        assert!(extract_renglones("<html></html>").unwrap().is_empty());
    }

    #[test]
    fn test_cookie_header_format() {
        let capture = SessionCapture {
            id_cot: "21941".into(),
            url: "https://portal".into(),
            margen: String::new(),
            renglones: vec![],
            cookies: vec![
                ("ASP.NET_SessionId".into(), "abc123".into()),
                ("portal_auth".into(), "tok".into()),
            ],
        };
        assert_eq!(
            capture.cookie_header(),
            "ASP.NET_SessionId=abc123; portal_auth=tok"
        );
    }
}
