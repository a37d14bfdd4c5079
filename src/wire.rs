//! Portal wire-format parsing.
//!
//! The `BuscarOfertas` endpoint answers a single JSON object `{"d": "..."}`
//! where the payload packs four segments separated by `@@`:
//!
//! ```text
//! <ofertas JSON array>@@<presupuesto money>@@<oferta_min money>@@<mensaje>
//! ```
//!
//! Example: `"[{...}]@@$ 21.696.480,0000@@$ 20.015.101,6000@@"`
//!
//! Everything downstream of this module works with typed records; raw
//! strings never leave the collector boundary.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::money::parse_money;

/// Label substring the portal uses to mark the currently leading offer.
pub const LEADER_LABEL: &str = "Vigente";

/// Envelope of every portal XHR response.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalEnvelope {
    pub d: String,
}

/// One offer row as the portal serializes it inside the `d` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    #[serde(default)]
    pub id_oferta_subasta: Option<i64>,
    #[serde(default)]
    pub id_renglon: Option<i64>,
    #[serde(default)]
    pub id_proveedor: Option<i64>,
    #[serde(default)]
    pub proveedor: String,
    #[serde(default)]
    pub monto: f64,
    #[serde(default)]
    pub monto_a_mostrar: String,
    /// "Vigente" for the leader, "Superada" otherwise.
    #[serde(default)]
    pub mejor_oferta: String,
    /// HH:MM:SS event time as reported by the portal.
    #[serde(default)]
    pub hora: String,
}

impl Offer {
    pub fn is_leader_label(&self) -> bool {
        self.mejor_oferta.contains(LEADER_LABEL)
    }
}

/// Parsed content of one `d` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub ofertas: Vec<Offer>,
    pub presupuesto_txt: String,
    pub presupuesto_val: Option<f64>,
    pub oferta_min_txt: String,
    pub oferta_min_val: Option<f64>,
    pub mejor_oferta_txt: String,
    pub mejor_oferta_val: Option<f64>,
    pub hora_ultima_oferta: Option<String>,
    pub mensaje: String,
}

impl ParsedResponse {
    /// The leading offer: the one labeled "Vigente", or failing that the
    /// lowest monto (ties broken by earlier hora).
    pub fn leader(&self) -> Option<&Offer> {
        if let Some(o) = self.ofertas.iter().find(|o| o.is_leader_label()) {
            return Some(o);
        }
        self.ofertas.iter().min_by(|a, b| {
            a.monto
                .partial_cmp(&b.monto)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hora.cmp(&b.hora))
        })
    }
}

/// Split and parse a raw `d` payload.
///
/// Fails on malformed segmentation (< 3 segments) or an offers segment that
/// is not a JSON array. Empty/`null` offers segments parse as zero offers.
pub fn parse_d_field(d: &str) -> Result<ParsedResponse> {
    let parts: Vec<&str> = d.split("@@").collect();
    if parts.len() < 3 {
        bail!(
            "payload malformado: se esperaban 3+ segmentos separados por '@@', hay {}",
            parts.len()
        );
    }

    let grid = parts[0];
    let presupuesto_txt = parts[1].to_string();
    let oferta_min_txt = parts[2].to_string();
    let mensaje = parts.get(3).copied().unwrap_or("").to_string();

    let ofertas: Vec<Offer> = if grid.is_empty() || grid == "null" {
        Vec::new()
    } else {
        serde_json::from_str(grid).context("el segmento de ofertas no es un array JSON válido")?
    };

    let (mejor_oferta_txt, mejor_oferta_val, hora_ultima_oferta) = match ofertas.first() {
        Some(best) => (
            best.monto_a_mostrar.clone(),
            parse_money(&best.monto_a_mostrar).or(Some(best.monto)),
            if best.hora.is_empty() {
                None
            } else {
                Some(best.hora.clone())
            },
        ),
        None => (String::new(), None, None),
    };

    Ok(ParsedResponse {
        ofertas,
        presupuesto_val: parse_money(&presupuesto_txt),
        presupuesto_txt,
        oferta_min_val: parse_money(&oferta_min_txt),
        oferta_min_txt,
        mejor_oferta_txt,
        mejor_oferta_val,
        hora_ultima_oferta,
        mensaje,
    })
}

/// Parse a full `{"d": "..."}` envelope body.
pub fn parse_envelope(body: &str) -> Result<ParsedResponse> {
    let envelope: PortalEnvelope =
        serde_json::from_str(body).context("respuesta del portal no es {\"d\": ...}")?;
    parse_d_field(&envelope.d)
}
