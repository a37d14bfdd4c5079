//! Record types for the persistence layer.

/// Auction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionState {
    Running,
    Paused,
    Ended,
    Error,
}

impl AuctionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionState::Running => "RUNNING",
            AuctionState::Paused => "PAUSED",
            AuctionState::Ended => "ENDED",
            AuctionState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(AuctionState::Running),
            "PAUSED" => Some(AuctionState::Paused),
            "ENDED" => Some(AuctionState::Ended),
            "ERROR" => Some(AuctionState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuctionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One auction row.
#[derive(Debug, Clone)]
pub struct AuctionRow {
    pub id: i64,
    pub id_cot: String,
    pub url: String,
    pub estado: AuctionState,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub last_ok_at: Option<String>,
    pub last_http_code: Option<u16>,
    pub err_streak: u32,
    pub mi_id_proveedor: Option<String>,
}

/// Latest observed state of a line item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateRow {
    pub mejor_oferta_txt: Option<String>,
    pub oferta_min_txt: Option<String>,
    pub presupuesto_txt: Option<String>,
    pub mejor_oferta: Option<f64>,
    pub oferta_min: Option<f64>,
    pub presupuesto: Option<f64>,
    pub mensaje: Option<String>,
    pub updated_at: String,
}

/// User-maintained cost data for a line item (derived columns live in the
/// same row but are written only by the engine).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostsRow {
    pub unidad_medida: Option<String>,
    pub cantidad: Option<f64>,
    pub items_por_renglon: Option<f64>,
    pub marca: Option<String>,
    pub obs_usuario: Option<String>,
    pub conv_usd: Option<f64>,
    pub costo_unit_usd: Option<f64>,
    pub costo_total_usd: Option<f64>,
    pub costo_unit_ars: Option<f64>,
    pub costo_total_ars: Option<f64>,
    /// Fraction: 0.30 == 30%.
    pub renta_minima: Option<f64>,
    pub seguir: bool,
    pub oferta_mia: bool,
    pub ocultar_bajo_umbral: bool,
}

/// One row of the export surface. Margins are exported as percentages.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub id_subasta: String,
    pub item: String,
    pub descripcion: String,
    pub unidad_medida: Option<String>,
    pub cantidad: Option<f64>,
    pub items_por_renglon: Option<f64>,
    pub marca: Option<String>,
    pub obs_usuario: Option<String>,
    pub conv_usd: Option<f64>,
    pub costo_unit_usd: Option<f64>,
    pub costo_total_usd: Option<f64>,
    pub costo_unit_ars: Option<f64>,
    pub costo_total_ars: Option<f64>,
    /// Percentage (stored fraction x 100).
    pub renta_minima_pct: Option<f64>,
    pub precio_unit_aceptable: Option<f64>,
    pub precio_total_aceptable: Option<f64>,
    pub precio_ref_unitario: Option<f64>,
    pub renta_referencia_pct: Option<f64>,
    pub mejor_oferta_txt: Option<String>,
    pub precio_unit_mejora: Option<f64>,
    pub renta_para_mejorar_pct: Option<f64>,
}
