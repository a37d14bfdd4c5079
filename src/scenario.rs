//! Replay scenario files.
//!
//! A scenario is a JSON document with portal-real response payloads keyed
//! by tick index. Loading validates the whole document up front so a bad
//! scenario refuses to start instead of failing mid-replay.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::wire;

/// Allowed simulated HTTP statuses in a timeline.
pub const VALID_STATUSES: &[u16] = &[200, 500, 502, 503, 504];

/// Raw portal response recorded for one line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub id_renglon: String,
    #[serde(default)]
    pub descripcion: String,
    /// `{"d": "...@@...@@...@@"}` exactly as the portal sent it.
    pub response_json: ResponseJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseJson {
    pub d: String,
}

/// State of the system at one tick of the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub tick: u64,
    /// Advisory wall-clock "HH:MM:SS".
    pub hora: String,
    pub status: u16,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub renglones: Option<Vec<RecordedResponse>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Special event marker ("end_auction").
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubastaRef {
    pub id_cot: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSettings {
    pub tick_duration_seconds: f64,
    pub max_ticks: u64,
}

/// A fully validated scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub scenario_name: String,
    pub description: String,
    pub subasta: SubastaRef,
    pub config: ScenarioSettings,
    pub timeline: Vec<TimelineEntry>,
}

impl Scenario {
    /// Parse and validate a scenario from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let scenario: Scenario =
            serde_json::from_str(text).context("escenario JSON inválido o con campos faltantes")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("no se pudo leer el escenario {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("escenario inválido: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.subasta.id_cot.is_empty() {
            bail!("subasta.id_cot vacío");
        }
        if self.timeline.is_empty() {
            bail!("el timeline no puede estar vacío");
        }

        let mut prev_tick: Option<u64> = None;
        for (i, entry) in self.timeline.iter().enumerate() {
            if let Some(prev) = prev_tick {
                if entry.tick <= prev {
                    bail!(
                        "timeline[{}]: tick {} no es estrictamente creciente (anterior {})",
                        i,
                        entry.tick,
                        prev
                    );
                }
            }
            prev_tick = Some(entry.tick);

            if !VALID_STATUSES.contains(&entry.status) {
                bail!(
                    "timeline[{}]: status HTTP inválido {} (válidos: {:?})",
                    i,
                    entry.status,
                    VALID_STATUSES
                );
            }

            if let Some(renglones) = &entry.renglones {
                for r in renglones {
                    if r.id_renglon.is_empty() {
                        bail!("timeline[{}]: renglón sin id_renglon", i);
                    }
                    wire::parse_d_field(&r.response_json.d).with_context(|| {
                        format!(
                            "timeline[{}] renglón {}: payload 'd' malformado",
                            i, r.id_renglon
                        )
                    })?;
                }
            }
        }
        Ok(())
    }

    /// The timeline entry governing tick `n`: the one with the largest
    /// index <= n. Gaps repeat the last recorded state.
    pub fn entry_for_tick(&self, n: u64) -> Option<&TimelineEntry> {
        self.timeline.iter().rev().find(|e| e.tick <= n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "scenario_name": "test",
            "description": "scenario de prueba",
            "subasta": { "id_cot": "22053", "url": "https://portal/subasta?x=1" },
            "config": { "tick_duration_seconds": 1.0, "max_ticks": 20 },
            "timeline": [
                {
                    "tick": 1,
                    "hora": "10:00:00",
                    "status": 200,
                    "renglones": [{
                        "id_renglon": "836160",
                        "descripcion": "Insumo A",
                        "response_json": { "d": "[]@@$ 1.000,00@@$ 990,00@@" }
                    }]
                },
                { "tick": 5, "hora": "10:00:04", "status": 500, "error_message": "timeout BD" }
            ]
        })
    }

    #[test]
    fn test_load_valid_scenario() {
        let s = Scenario::from_json(&minimal_json().to_string()).unwrap();
        assert_eq!(s.subasta.id_cot, "22053");
        assert_eq!(s.timeline.len(), 2);
        assert_eq!(s.config.max_ticks, 20);
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let mut v = minimal_json();
        v.as_object_mut().unwrap().remove("subasta");
        assert!(Scenario::from_json(&v.to_string()).is_err());

        let mut v = minimal_json();
        v["config"].as_object_mut().unwrap().remove("max_ticks");
        assert!(Scenario::from_json(&v.to_string()).is_err());
    }

    #[test]
    fn test_non_monotonic_timeline_rejected() {
        let mut v = minimal_json();
        v["timeline"][1]["tick"] = serde_json::json!(1);
        let err = Scenario::from_json(&v.to_string()).unwrap_err();
        assert!(format!("{:#}", err).contains("estrictamente creciente"));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut v = minimal_json();
        v["timeline"][1]["status"] = serde_json::json!(418);
        assert!(Scenario::from_json(&v.to_string()).is_err());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let mut v = minimal_json();
        v["timeline"][0]["renglones"][0]["response_json"]["d"] =
            serde_json::json!("sin-separadores");
        let err = Scenario::from_json(&v.to_string()).unwrap_err();
        assert!(format!("{:#}", err).contains("malformado"));
    }

    #[test]
    fn test_empty_timeline_rejected() {
        let mut v = minimal_json();
        v["timeline"] = serde_json::json!([]);
        assert!(Scenario::from_json(&v.to_string()).is_err());
    }

    #[test]
    fn test_entry_for_tick_gaps_repeat_last() {
        let s = Scenario::from_json(&minimal_json().to_string()).unwrap();
        assert!(s.entry_for_tick(0).is_none());
        assert_eq!(s.entry_for_tick(1).unwrap().tick, 1);
        // Gap between 1 and 5: the tick-1 entry still governs.
        assert_eq!(s.entry_for_tick(3).unwrap().tick, 1);
        assert_eq!(s.entry_for_tick(5).unwrap().tick, 5);
        assert_eq!(s.entry_for_tick(99).unwrap().tick, 5);
    }
}
