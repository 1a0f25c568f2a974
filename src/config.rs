//! Runtime-adjustable settings shared by every component of a session.

use parking_lot::RwLock;
use serde::{ Deserialize, Serialize };
use std::{ path::Path, str::FromStr, sync::Arc, time::Duration };

use crate::{
    error::{ AvcError, Result },
    gap::{ self, GapConfig },
    sampler, tracker, volume,
};

pub const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 3000;
pub const DEFAULT_SAMPLE_LEAD_MS: u64 = 2000;

/// How song-boundary mode resolves an ambient estimate for a boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryStrategy {
    /// Sample right after the boundary event.
    Immediate,
    /// Sample `sample_lead_ms` before the predicted end of the current track and apply the
    /// cached value at the next boundary; falls back to `Immediate` without duration info.
    #[default]
    EndOfTrack,
}

impl std::fmt::Display for BoundaryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundaryStrategy::Immediate => write!(f, "immediate"),
            BoundaryStrategy::EndOfTrack => write!(f, "end-of-track"),
        }
    }
}

impl FromStr for BoundaryStrategy {
    type Err = AvcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" | "now" => Ok(BoundaryStrategy::Immediate),
            "end-of-track" | "end_of_track" | "eot" => Ok(BoundaryStrategy::EndOfTrack),
            _ => Err(AvcError::invalid_setting("boundary-strategy", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub window_size: usize,
    pub percentile: f32,
    pub absolute_floor_db: f32,
    pub drop_db: f32,
    pub silence_duration_ms: u64,
    pub sample_duration_ms: u64,
    pub target_ratio_db: f32,
    pub min_volume_step: u32,
    pub debounce_window_ms: u64,
    pub sample_lead_ms: u64,
    pub max_volume_step: u32,
    pub boundary_strategy: BoundaryStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_size: tracker::DEFAULT_WINDOW_SIZE,
            percentile: tracker::DEFAULT_PERCENTILE,
            absolute_floor_db: gap::DEFAULT_ABSOLUTE_FLOOR_DB,
            drop_db: gap::DEFAULT_DROP_DB,
            silence_duration_ms: gap::DEFAULT_SILENCE_DURATION_MS,
            sample_duration_ms: sampler::DEFAULT_SAMPLE_DURATION_MS,
            target_ratio_db: volume::DEFAULT_TARGET_RATIO_DB,
            min_volume_step: volume::DEFAULT_MIN_VOLUME_STEP,
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            sample_lead_ms: DEFAULT_SAMPLE_LEAD_MS,
            max_volume_step: volume::DEFAULT_MAX_VOLUME_STEP,
            boundary_strategy: BoundaryStrategy::default(),
        }
    }
}

/// Option names accepted by [`Settings::set`].
pub const SETTING_KEYS: &[&str] = &[
    "window-size",
    "percentile",
    "absolute-floor-db",
    "drop-db",
    "silence-duration-ms",
    "sample-duration-ms",
    "target-ratio-db",
    "min-volume-step",
    "debounce-window-ms",
    "sample-lead-ms",
    "max-volume-step",
    "boundary-strategy",
];

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| AvcError::invalid_setting(key, value))
}

fn parse_finite(key: &str, value: &str) -> Result<f32> {
    let v: f32 = parse(key, value)?;
    if v.is_finite() { Ok(v) } else { Err(AvcError::invalid_setting(key, value)) }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match parse::<u64>(key, value)? {
        0 => Err(AvcError::invalid_setting(key, value)),
        v => Ok(v),
    }
}

impl Settings {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Change one option by its kebab-case name. On error `self` is left untouched.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = key.trim().replace('_', "-").to_ascii_lowercase();
        let k = key.as_str();
        match k {
            "window-size" => {
                let v: usize = parse(k, value)?;
                if v == 0 {
                    return Err(AvcError::invalid_setting(k, value));
                }
                self.window_size = v;
            }
            "percentile" => {
                let v = parse_finite(k, value)?;
                if !(0.0..=1.0).contains(&v) {
                    return Err(AvcError::invalid_setting(k, value));
                }
                self.percentile = v;
            }
            "absolute-floor-db" => {
                self.absolute_floor_db = parse_finite(k, value)?;
            }
            "drop-db" => {
                self.drop_db = parse_finite(k, value)?;
            }
            "silence-duration-ms" => {
                self.silence_duration_ms = parse_positive(k, value)?;
            }
            "sample-duration-ms" => {
                self.sample_duration_ms = parse_positive(k, value)?;
            }
            "target-ratio-db" => {
                self.target_ratio_db = parse_finite(k, value)?;
            }
            "min-volume-step" => {
                self.min_volume_step = parse(k, value)?;
            }
            "debounce-window-ms" => {
                self.debounce_window_ms = parse(k, value)?;
            }
            "sample-lead-ms" => {
                self.sample_lead_ms = parse(k, value)?;
            }
            "max-volume-step" => {
                let v: u32 = parse(k, value)?;
                if v == 0 {
                    return Err(AvcError::invalid_setting(k, value));
                }
                self.max_volume_step = v;
            }
            "boundary-strategy" => {
                self.boundary_strategy = value.parse()?;
            }
            _ => {
                return Err(AvcError::UnknownSetting(key.clone()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |k: &str, v: String| Err(AvcError::invalid_setting(k, &v));
        if self.window_size == 0 {
            return bad("window-size", self.window_size.to_string());
        }
        if !(0.0..=1.0).contains(&self.percentile) {
            return bad("percentile", self.percentile.to_string());
        }
        if self.silence_duration_ms == 0 {
            return bad("silence-duration-ms", "0".into());
        }
        if self.sample_duration_ms == 0 {
            return bad("sample-duration-ms", "0".into());
        }
        if self.max_volume_step == 0 {
            return bad("max-volume-step", "0".into());
        }
        for (k, v) in [
            ("absolute-floor-db", self.absolute_floor_db),
            ("drop-db", self.drop_db),
            ("target-ratio-db", self.target_ratio_db),
        ] {
            if !v.is_finite() {
                return bad(k, v.to_string());
            }
        }
        Ok(())
    }

    pub fn gap_config(&self) -> GapConfig {
        GapConfig {
            absolute_floor_db: self.absolute_floor_db,
            drop_db: self.drop_db,
            silence_duration: Duration::from_millis(self.silence_duration_ms),
            alpha: gap::BASELINE_ALPHA,
        }
    }

    pub fn sample_duration(&self) -> Duration {
        Duration::from_millis(self.sample_duration_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn sample_lead(&self) -> Duration {
        Duration::from_millis(self.sample_lead_ms)
    }
}

/// Shared, live view of [`Settings`]. Consumers read it on every reading or event.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle(Arc<RwLock<Settings>>);

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    /// Copy of the current values.
    pub fn get(&self) -> Settings {
        self.0.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.0.read())
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.write().set(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.window_size, 200);
        assert_eq!(s.percentile, 0.15);
        assert_eq!(s.absolute_floor_db, 35.0);
        assert_eq!(s.drop_db, 15.0);
        assert_eq!(s.silence_duration_ms, 1500);
        assert_eq!(s.sample_duration_ms, 800);
        assert_eq!(s.target_ratio_db, 10.0);
        assert_eq!(s.min_volume_step, 1);
        assert_eq!(s.debounce_window_ms, 3000);
        assert_eq!(s.sample_lead_ms, 2000);
        assert_eq!(s.boundary_strategy, BoundaryStrategy::EndOfTrack);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn every_listed_key_is_settable() {
        let mut s = Settings::default();
        for key in SETTING_KEYS {
            let value = match *key {
                "percentile" => "0.2",
                "boundary-strategy" => "immediate",
                _ => "7",
            };
            assert!(s.set(key, value).is_ok(), "{key}");
        }
        assert_eq!(s.window_size, 7);
        assert_eq!(s.boundary_strategy, BoundaryStrategy::Immediate);
    }

    #[test]
    fn invalid_values_leave_settings_unchanged() {
        let mut s = Settings::default();
        assert!(matches!(s.set("percentile", "1.5"), Err(AvcError::InvalidSetting { .. })));
        assert!(matches!(s.set("window-size", "0"), Err(AvcError::InvalidSetting { .. })));
        assert!(matches!(s.set("drop-db", "loud"), Err(AvcError::InvalidSetting { .. })));
        assert!(matches!(s.set("volume", "3"), Err(AvcError::UnknownSetting(_))));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn snake_case_keys_are_accepted() {
        let mut s = Settings::default();
        s.set("target_ratio_db", "12.5").ok();
        assert_eq!(s.target_ratio_db, 12.5);
    }

    #[test]
    fn json_fills_missing_keys_with_defaults() {
        let s: Settings = serde_json::from_str(r#"{ "drop-db": 20, "boundary-strategy": "immediate" }"#)
            .unwrap();
        assert_eq!(s.drop_db, 20.0);
        assert_eq!(s.boundary_strategy, BoundaryStrategy::Immediate);
        assert_eq!(s.window_size, 200);
    }

    #[test]
    fn handle_shares_updates() {
        let h = SettingsHandle::default();
        let other = h.clone();
        h.set("sample-lead-ms", "1500").ok();
        assert_eq!(other.read(|s| s.sample_lead()), Duration::from_millis(1500));
    }
}
