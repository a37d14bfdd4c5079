//! Alert decisions for line items.
//!
//! Takes the consolidated state of one line item (portal observation +
//! user configuration + derived margins) and decides style, sound and
//! visibility. It does not play sounds or color widgets; the UI applies
//! the returned decision.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Logical row styles; the UI maps them to concrete colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStyle {
    Normal,
    /// Followed line item with nothing else to report.
    Tracked,
    /// Best offer moved up.
    AlertUp,
    /// Best offer moved down (opportunity).
    AlertDown,
    /// The bidder currently leads this line item.
    Winner,
    /// The bidder just lost the lead; latched until a further change.
    Loser,
}

impl std::fmt::Display for RowStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RowStyle::Normal => "NORMAL",
            RowStyle::Tracked => "TRACKED",
            RowStyle::AlertUp => "ALERT_UP",
            RowStyle::AlertDown => "ALERT_DOWN",
            RowStyle::Winner => "WINNER",
            RowStyle::Loser => "LOSER",
        };
        write!(f, "{}", s)
    }
}

/// Logical sound identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoundCue {
    None,
    /// Tracked line item changed.
    Alert,
    /// Price dropped (opportunity).
    Opportunity,
    /// The bidder lost the lead.
    Loss,
}

/// Direction of the best-offer numeric between two consecutive observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDirection {
    Down,
    Up,
    Flat,
}

/// Consolidated inputs for one decision.
#[derive(Debug, Clone)]
pub struct AlertInputs<'a> {
    pub id_renglon: &'a str,
    /// Followed by the user (explicit flag or loaded cost).
    pub tracked: bool,
    /// The bidder's offer currently leads.
    pub is_leader: bool,
    /// Anything relevant changed in this observation.
    pub changed: bool,
    pub direction: PriceDirection,
    pub renta_para_mejorar: Option<f64>,
    pub renta_minima: Option<f64>,
    pub ocultar_bajo_umbral: bool,
}

/// Decision for one line item in one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDecision {
    pub style: RowStyle,
    /// Tracked tint applies on top of whatever style was decided.
    pub tracked_tint: bool,
    pub sound: SoundCue,
    pub hide: bool,
    pub message: String,
}

impl Default for AlertDecision {
    fn default() -> Self {
        Self {
            style: RowStyle::Normal,
            tracked_tint: false,
            sound: SoundCue::None,
            hide: false,
            message: String::new(),
        }
    }
}

/// Stateful rule engine: remembers leadership and loser latches per line
/// item, and debounces sounds with a refractory window.
pub struct AlertEngine {
    refractory: Duration,
    was_leader: FxHashMap<String, bool>,
    loser_latched: FxHashMap<String, bool>,
    last_sound_at: FxHashMap<String, Instant>,
}

impl AlertEngine {
    /// Default refractory window between sounds for the same line item.
    pub const DEFAULT_REFRACTORY: Duration = Duration::from_secs(5);

    pub fn new(refractory: Duration) -> Self {
        Self {
            refractory,
            was_leader: FxHashMap::default(),
            loser_latched: FxHashMap::default(),
            last_sound_at: FxHashMap::default(),
        }
    }

    pub fn decide(&mut self, inputs: &AlertInputs<'_>) -> AlertDecision {
        let rid = inputs.id_renglon.to_string();
        let was_leader = self.was_leader.get(&rid).copied().unwrap_or(false);
        let mut latched = self.loser_latched.get(&rid).copied().unwrap_or(false);

        // Leadership transitions.
        if inputs.is_leader {
            latched = false;
        } else if was_leader {
            latched = true;
        } else if latched && inputs.changed {
            // A further change releases the one-shot latch.
            latched = false;
        }
        self.was_leader.insert(rid.clone(), inputs.is_leader);
        self.loser_latched.insert(rid.clone(), latched);

        let lost_now = was_leader && !inputs.is_leader;

        let (style, message) = if inputs.is_leader {
            (RowStyle::Winner, "Oferta propia lidera".to_string())
        } else if lost_now || latched {
            (RowStyle::Loser, "Oferta propia superada".to_string())
        } else {
            match inputs.direction {
                PriceDirection::Down => (
                    RowStyle::AlertDown,
                    "Mejor oferta bajó (oportunidad)".to_string(),
                ),
                PriceDirection::Up => (RowStyle::AlertUp, "Mejor oferta subió".to_string()),
                PriceDirection::Flat if inputs.tracked => {
                    (RowStyle::Tracked, "En seguimiento".to_string())
                }
                PriceDirection::Flat => (RowStyle::Normal, String::new()),
            }
        };

        let hide = inputs.ocultar_bajo_umbral
            && matches!(
                (inputs.renta_para_mejorar, inputs.renta_minima),
                (Some(renta), Some(min)) if renta < min
            );

        let wanted_sound = if lost_now {
            SoundCue::Loss
        } else if style == RowStyle::AlertDown {
            SoundCue::Opportunity
        } else if inputs.tracked && inputs.changed {
            SoundCue::Alert
        } else {
            SoundCue::None
        };
        let sound = self.debounce_sound(&rid, wanted_sound);

        AlertDecision {
            style,
            tracked_tint: inputs.tracked,
            sound,
            hide,
            message,
        }
    }

    /// Suppress a sound if one fired for this line item inside the
    /// refractory window.
    fn debounce_sound(&mut self, rid: &str, cue: SoundCue) -> SoundCue {
        if cue == SoundCue::None {
            return cue;
        }
        let now = Instant::now();
        if let Some(last) = self.last_sound_at.get(rid) {
            if now.duration_since(*last) < self.refractory {
                return SoundCue::None;
            }
        }
        self.last_sound_at.insert(rid.to_string(), now);
        cue
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(Self::DEFAULT_REFRACTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(rid: &'a str) -> AlertInputs<'a> {
        AlertInputs {
            id_renglon: rid,
            tracked: false,
            is_leader: false,
            changed: false,
            direction: PriceDirection::Flat,
            renta_para_mejorar: None,
            renta_minima: None,
            ocultar_bajo_umbral: false,
        }
    }

    fn engine_no_debounce() -> AlertEngine {
        AlertEngine::new(Duration::ZERO)
    }

    #[test]
    fn test_normal_row() {
        let mut e = engine_no_debounce();
        let d = e.decide(&inputs("r1"));
        assert_eq!(d.style, RowStyle::Normal);
        assert_eq!(d.sound, SoundCue::None);
        assert!(!d.tracked_tint);
        assert!(!d.hide);
    }

    #[test]
    fn test_price_down_is_opportunity() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.direction = PriceDirection::Down;
        i.changed = true;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::AlertDown);
        assert_eq!(d.sound, SoundCue::Opportunity);
    }

    #[test]
    fn test_price_up_no_sound() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.direction = PriceDirection::Up;
        i.changed = true;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::AlertUp);
        assert_eq!(d.sound, SoundCue::None);
    }

    #[test]
    fn test_winner_style_no_sound() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.is_leader = true;
        i.direction = PriceDirection::Down;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::Winner);
        assert_eq!(d.sound, SoundCue::None);
    }

    #[test]
    fn test_loser_one_shot_latch() {
        let mut e = engine_no_debounce();

        // Tick 1: we lead.
        let mut i = inputs("r1");
        i.is_leader = true;
        assert_eq!(e.decide(&i).style, RowStyle::Winner);

        // Tick 2: lead lost -> Loser with sound.
        let mut i = inputs("r1");
        i.changed = true;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::Loser);
        assert_eq!(d.sound, SoundCue::Loss);

        // Tick 3: nothing changed -> still latched, no new sound.
        let i = inputs("r1");
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::Loser);
        assert_eq!(d.sound, SoundCue::None);

        // Tick 4: a further change releases the latch.
        let mut i = inputs("r1");
        i.changed = true;
        i.direction = PriceDirection::Down;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::AlertDown);
    }

    #[test]
    fn test_tracked_tint_on_top_of_styles() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.tracked = true;
        i.direction = PriceDirection::Down;
        i.changed = true;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::AlertDown);
        assert!(d.tracked_tint);
    }

    #[test]
    fn test_tracked_change_sound() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.tracked = true;
        i.changed = true;
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::Tracked);
        assert_eq!(d.sound, SoundCue::Alert);
    }

    #[test]
    fn test_hide_below_threshold() {
        let mut e = engine_no_debounce();
        let mut i = inputs("r1");
        i.renta_para_mejorar = Some(0.05);
        i.renta_minima = Some(0.30);
        i.ocultar_bajo_umbral = true;
        assert!(e.decide(&i).hide);

        // Same margins without the flag: visible.
        let mut i2 = inputs("r2");
        i2.renta_para_mejorar = Some(0.05);
        i2.renta_minima = Some(0.30);
        assert!(!e.decide(&i2).hide);

        // Above threshold: visible.
        let mut i3 = inputs("r3");
        i3.renta_para_mejorar = Some(0.40);
        i3.renta_minima = Some(0.30);
        i3.ocultar_bajo_umbral = true;
        assert!(!e.decide(&i3).hide);
    }

    #[test]
    fn test_sound_debounce_refractory() {
        let mut e = AlertEngine::new(Duration::from_secs(60));

        let mut i = inputs("r1");
        i.direction = PriceDirection::Down;
        i.changed = true;
        assert_eq!(e.decide(&i).sound, SoundCue::Opportunity);

        // Second drop right away: style stays, sound suppressed.
        let d = e.decide(&i);
        assert_eq!(d.style, RowStyle::AlertDown);
        assert_eq!(d.sound, SoundCue::None);

        // Other line items are debounced independently.
        let mut other = inputs("r2");
        other.direction = PriceDirection::Down;
        other.changed = true;
        assert_eq!(e.decide(&other).sound, SoundCue::Opportunity);
    }
}
