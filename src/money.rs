//! Parsing and formatting of portal-style money strings.
//!
//! The portal renders amounts with Argentine conventions: `"$ 20.115.680,0000"`
//! (dot thousands, comma decimals). We keep the raw text for display and
//! convert to `f64` for calculations and SQLite.

/// Parse a portal money string into a float.
///
/// Tolerant of a missing `$` prefix, surrounding whitespace, varying decimal
/// places and the literal `"null"`. Returns `None` when nothing numeric
/// remains.
pub fn parse_money(txt: &str) -> Option<f64> {
    let s = txt.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") {
        return None;
    }

    // Keep digits, separators and sign; drop "$", NBSP and anything else.
    let mut cleaned = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' || c == '-' {
            cleaned.push(c);
        }
    }
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }

    // "20.115.680,0000" -> "20115680.0000"
    let normalized = cleaned.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok()
}

/// Format a float back into portal style, e.g. `20115680.0` -> `"$ 20.115.680,0000"`.
///
/// Display-only helper; it does not have to be byte-identical to the portal.
pub fn format_money(value: f64, decimals: usize) -> String {
    let negative = value < 0.0;
    let abs = value.abs();

    let int_part = abs.trunc() as u64;
    let frac = abs.fract();

    let mut int_txt = int_part.to_string();
    let mut grouped = String::with_capacity(int_txt.len() + int_txt.len() / 3);
    let offset = int_txt.len() % 3;
    let bytes: Vec<char> = int_txt.drain(..).collect();
    for (i, c) in bytes.iter().enumerate() {
        if i > 0 && (i + 3 - offset) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*c);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str("$ ");
    out.push_str(&grouped);
    if decimals > 0 {
        let scaled = (frac * 10f64.powi(decimals as i32)).round() as u64;
        out.push(',');
        out.push_str(&format!("{:0width$}", scaled, width = decimals));
    }
    out
}
