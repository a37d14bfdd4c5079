//! Derived business metrics for a line item.
//!
//! All rules operate on nullable numerics: a missing input yields a missing
//! output, and divisions guard against null and zero divisors. The engine
//! recomputes these on every observation; the user-editable inputs come from
//! the costs row.

/// User-supplied cost inputs for one line item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostInputs {
    pub cantidad: Option<f64>,
    pub items_por_renglon: Option<f64>,
    pub conv_usd: Option<f64>,
    pub costo_unit_usd: Option<f64>,
    pub costo_total_usd: Option<f64>,
    pub costo_unit_ars: Option<f64>,
    pub costo_total_ars: Option<f64>,
    /// Minimum acceptable margin as a fraction (0.30 == 30%).
    pub renta_minima: Option<f64>,
}

/// Everything the engine derives from costs + the latest observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedMetrics {
    pub cantidad_equivalente: Option<f64>,
    pub costo_unit_ars: Option<f64>,
    pub costo_total_ars: Option<f64>,
    pub costo_unit_usd: Option<f64>,
    pub costo_total_usd: Option<f64>,
    pub precio_unit_aceptable: Option<f64>,
    pub precio_total_aceptable: Option<f64>,
    pub precio_ref_unitario: Option<f64>,
    pub renta_referencia: Option<f64>,
    pub precio_unit_mejora: Option<f64>,
    pub renta_para_mejorar: Option<f64>,
}

/// Tolerance for the unit×eq vs total consistency check, in ARS.
pub const COST_PAIR_TOLERANCE: f64 = 0.01;

pub fn safe_mul(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(a? * b?)
}

pub fn safe_div(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match b {
        Some(d) if d != 0.0 => Some(a? / d),
        _ => None,
    }
}

/// Normalize the bundling factor: anything missing, non-finite or <= 0 is 1.
///
/// Returns the factor plus whether the input was invalid (so callers can log
/// the WARN once).
pub fn normalize_items_por_renglon(items: Option<f64>) -> (f64, bool) {
    match items {
        None => (1.0, false),
        Some(v) if v.is_finite() && v > 0.0 => (v, false),
        Some(_) => (1.0, true),
    }
}

/// Equivalent unit quantity: cantidad / items_por_renglon.
pub fn cantidad_equivalente(cantidad: Option<f64>, items: Option<f64>) -> Option<f64> {
    let (factor, _) = normalize_items_por_renglon(items);
    Some(cantidad? / factor)
}

/// Bidirectional resolution of the ARS cost pair.
///
/// - Both present and inconsistent beyond the tolerance: TOTAL wins, the
///   unit cost is recomputed as total / eq.
/// - Only one present: the other is computed.
/// - Neither: both stay `None`.
pub fn resolve_cost_pair(
    unit: Option<f64>,
    total: Option<f64>,
    eq: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    match (unit, total) {
        (Some(u), Some(t)) => {
            let consistent = match eq {
                Some(q) => (u * q - t).abs() <= COST_PAIR_TOLERANCE,
                None => true,
            };
            if consistent {
                (Some(u), Some(t))
            } else {
                (safe_div(Some(t), eq), Some(t))
            }
        }
        (Some(u), None) => (Some(u), safe_mul(Some(u), eq)),
        (None, Some(t)) => (safe_div(Some(t), eq), Some(t)),
        (None, None) => (None, None),
    }
}

/// Compute the full derived set for one line item.
pub fn derive(
    inputs: &CostInputs,
    oferta_min: Option<f64>,
    presupuesto: Option<f64>,
) -> DerivedMetrics {
    let eq = cantidad_equivalente(inputs.cantidad, inputs.items_por_renglon);

    let (unit_ars, total_ars) =
        resolve_cost_pair(inputs.costo_unit_ars, inputs.costo_total_ars, eq);

    // USD mirror: derive from ARS when a usable rate exists, otherwise keep
    // whatever the user typed.
    let fx = inputs.conv_usd.filter(|v| *v != 0.0);
    let unit_usd = safe_div(unit_ars, fx).or(inputs.costo_unit_usd);
    let total_usd = safe_div(total_ars, fx).or(inputs.costo_total_usd);

    let markup = inputs.renta_minima.map(|r| 1.0 + r);
    let precio_unit_aceptable = safe_mul(markup, unit_ars);
    let precio_total_aceptable = safe_mul(markup, total_ars);

    let precio_ref_unitario = safe_div(presupuesto, eq);
    let renta_referencia = safe_div(precio_ref_unitario, unit_ars).map(|x| x - 1.0);

    let precio_unit_mejora = safe_div(oferta_min, eq);
    let renta_para_mejorar = safe_div(precio_unit_mejora, unit_ars).map(|x| x - 1.0);

    DerivedMetrics {
        cantidad_equivalente: eq,
        costo_unit_ars: unit_ars,
        costo_total_ars: total_ars,
        costo_unit_usd: unit_usd,
        costo_total_usd: total_usd,
        precio_unit_aceptable,
        precio_total_aceptable,
        precio_ref_unitario,
        renta_referencia,
        precio_unit_mejora,
        renta_para_mejorar,
    }
}

/// Unified per-unit reference price: the official budget divided by the
/// quantity when both exist, otherwise the reference price as received.
pub fn precio_ref_unitario(
    cantidad: Option<f64>,
    precio_referencia: Option<f64>,
    presupuesto: Option<f64>,
) -> Option<f64> {
    safe_div(presupuesto, cantidad).or(precio_referencia)
}

// =============================================================================
// Margin (renta) encoding
// =============================================================================

/// Normalize an ingested margin into a stored fraction.
///
/// Values >= 1.0 are read as percentages and divided by 100 ("30" -> 0.30);
/// values < 1.0 are already fractions and stored verbatim. The stored value
/// is never negative.
pub fn normalize_renta(value: f64) -> f64 {
    let v = if value >= 1.0 { value / 100.0 } else { value };
    v.max(0.0)
}

/// Stored fraction -> exported percentage (0.30 -> 30).
pub fn renta_to_export(fraction: f64) -> f64 {
    fraction * 100.0
}
