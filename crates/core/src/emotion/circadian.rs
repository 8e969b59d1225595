use chrono::{DateTime, Local, TimeZone, Timelike};
use std::f32::consts::PI;

use crate::types::PadVector;

/// Arousal swings fully with the day; pleasure and dominance follow at half strength.
const AROUSAL_WEIGHT: f32 = 1.0;
const PLEASURE_WEIGHT: f32 = 0.5;
const DOMINANCE_WEIGHT: f32 = 0.5;

/// Daily activity curve: +1 at the active hour, -1 at the quiet hour, joined by
/// half-cosine segments so the level is continuous and smooth around the clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircadianCurve {
    active_hour: f32,
    quiet_hour: f32,
}

impl CircadianCurve {
    pub fn new(active_hour: u32, quiet_hour: u32) -> Self {
        Self { active_hour: (active_hour % 24) as f32, quiet_hour: (quiet_hour % 24) as f32 }
    }

    /// Level in `[-1, 1]` at a fractional hour of day.
    pub fn level_at_hour(&self, hour: f32) -> f32 {
        let rising = (self.active_hour - self.quiet_hour).rem_euclid(24.0);
        if rising == 0.0 {
            return 0.0;
        }
        let falling = 24.0 - rising;
        let since_quiet = (hour - self.quiet_hour).rem_euclid(24.0);

        let level = if since_quiet <= rising {
            -(PI * since_quiet / rising).cos()
        } else {
            (PI * (since_quiet - rising) / falling).cos()
        };
        level.clamp(-1.0, 1.0)
    }

    pub fn level_at<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> f32 {
        let hour = at.hour() as f32 + at.minute() as f32 / 60.0 + at.second() as f32 / 3600.0;
        self.level_at_hour(hour)
    }
}

/// Resting affect that decay pulls toward, shifted by the time of day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub defaults: PadVector,
    pub amplitude: f32,
    pub curve: CircadianCurve,
}

impl Baseline {
    pub fn at_level(&self, level: f32) -> PadVector {
        let swing = self.amplitude * level;
        PadVector::new(
            self.defaults.pleasure + PLEASURE_WEIGHT * swing,
            self.defaults.arousal + AROUSAL_WEIGHT * swing,
            self.defaults.dominance + DOMINANCE_WEIGHT * swing,
        )
        .clamped()
    }

    /// Baseline at wall-clock time `at`, evaluated in the local time zone.
    pub fn at<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> PadVector {
        self.at_level(self.curve.level_at(&at.with_timezone(&Local)))
    }
}

/// Human-readable name for the part of the day.
pub fn phase_name(hour: u32) -> &'static str {
    match hour {
        5..=8 => "early morning (waking up)",
        9..=11 => "morning (alert)",
        12..=13 => "midday (peak energy)",
        14..=17 => "afternoon (active)",
        18..=21 => "evening (winding down)",
        22..=23 => "late night (low energy)",
        _ => "deep night (sleepy)",
    }
}
