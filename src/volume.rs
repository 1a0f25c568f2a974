//! Volume decision, change history and output sinks.

use chrono::{ DateTime, Local };
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::atomic::{ AtomicU32, Ordering },
};

use crate::{ config::SettingsHandle, error::{ AvcError, Result, SinkFailure } };

/// Desired levels at or below this map to the lowest step.
pub const QUIET_ROOM_DB: f32 = 30.0;
/// Desired levels at or above this map to the top step.
pub const LOUD_VENUE_DB: f32 = 90.0;

pub const DEFAULT_TARGET_RATIO_DB: f32 = 10.0;
pub const DEFAULT_MIN_VOLUME_STEP: u32 = 1;
pub const DEFAULT_MAX_VOLUME_STEP: u32 = 15;
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Unchanged,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
            Direction::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeChangeRecord {
    pub timestamp: DateTime<Local>,
    pub ambient_db: f32,
    pub old_volume: u32,
    pub new_volume: u32,
}

impl VolumeChangeRecord {
    pub fn direction(&self) -> Direction {
        use std::cmp::Ordering::*;
        match self.new_volume.cmp(&self.old_volume) {
            Greater => Direction::Up,
            Less => Direction::Down,
            Equal => Direction::Unchanged,
        }
    }

    pub fn changed(&self) -> bool {
        self.new_volume != self.old_volume
    }
}

/// Map an ambient estimate onto a discrete output step.
///
/// `desired = ambient + target_ratio`, normalized over 30..90 dB, scaled by `max_step`,
/// rounded and clamped to `[min_step, max_step]`. Pure; applying the step is the
/// caller's business (and is skipped when the record reports no change).
pub fn decide(
    ambient_db: f32,
    target_ratio_db: f32,
    min_step: u32,
    current_step: u32,
    max_step: u32
) -> VolumeChangeRecord {
    let desired_db = ambient_db + target_ratio_db;
    let normalized = ((desired_db - QUIET_ROOM_DB) / (LOUD_VENUE_DB - QUIET_ROOM_DB)).clamp(0.0, 1.0);
    let normalized = if normalized.is_nan() { 0.0 } else { normalized };
    let floor = min_step.min(max_step);
    let new_volume = ((normalized * (max_step as f32)).round() as u32).clamp(floor, max_step);

    VolumeChangeRecord {
        timestamp: Local::now(),
        ambient_db,
        old_volume: current_step,
        new_volume,
    }
}

/// Newest-first, bounded; trimming happens inside `push`.
#[derive(Debug, Clone)]
pub struct VolumeHistory {
    entries: VecDeque<VolumeChangeRecord>,
    capacity: usize,
}

impl Default for VolumeHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl VolumeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: VolumeChangeRecord) {
        self.entries.push_front(record);
        self.entries.truncate(self.capacity);
    }

    pub fn latest(&self) -> Option<&VolumeChangeRecord> {
        self.entries.front()
    }

    pub fn entries(&self) -> Vec<VolumeChangeRecord> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Sinks
// ───────────────────────────────────────────────────────────────────────────────

/// Output volume control. Failures are reported to the caller and never retried here.
pub trait VolumeSink: Send + Sync {
    fn current_step(&self) -> Result<u32>;

    fn max_step(&self) -> u32;

    fn set_step(&self, step: u32) -> Result<()>;

    fn name(&self) -> &str;
}

/// Where a sink takes its step count from.
#[derive(Debug, Clone)]
pub enum StepLimit {
    Fixed(u32),
    /// `max_volume_step` of the settings, re-read on every call.
    Settings(SettingsHandle),
}

impl StepLimit {
    pub fn get(&self) -> u32 {
        let max = match self {
            StepLimit::Fixed(max) => *max,
            StepLimit::Settings(settings) => settings.read(|s| s.max_volume_step),
        };
        max.max(1)
    }
}

/// In-process volume step counter.
#[derive(Debug)]
pub struct SoftwareVolume {
    current: AtomicU32,
    limit: StepLimit,
}

impl SoftwareVolume {
    pub fn new(initial: u32, max: u32) -> Self {
        Self::with_limit(initial, StepLimit::Fixed(max))
    }

    /// Max step follows `max-volume-step`, so a runtime change applies at the next decision.
    pub fn with_settings(initial: u32, settings: &SettingsHandle) -> Self {
        Self::with_limit(initial, StepLimit::Settings(settings.clone()))
    }

    fn with_limit(initial: u32, limit: StepLimit) -> Self {
        Self {
            current: AtomicU32::new(initial.min(limit.get())),
            limit,
        }
    }
}

impl VolumeSink for SoftwareVolume {
    fn current_step(&self) -> Result<u32> {
        // a lowered max clips the step that was set under the old one
        Ok(self.current.load(Ordering::SeqCst).min(self.limit.get()))
    }

    fn max_step(&self) -> u32 {
        self.limit.get()
    }

    fn set_step(&self, step: u32) -> Result<()> {
        let max = self.limit.get();
        if step > max {
            return Err(AvcError::sink(SinkFailure::Transient, format!("step {step} exceeds max {max}")));
        }
        self.current.store(step, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "software"
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Windows render endpoint volume
// ───────────────────────────────────────────────────────────────────────────────
#[cfg(target_os = "windows")]
pub mod system {
    use super::{ StepLimit, VolumeSink };
    use crate::{ config::SettingsHandle, error::{ AvcError, Result, SinkFailure } };
    use windows::Win32::{
        Foundation::E_ACCESSDENIED,
        Media::Audio::{ eConsole, eRender, Endpoints::IAudioEndpointVolume, IMMDeviceEnumerator, MMDeviceEnumerator },
        System::Com::{ CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED },
    };

    /// Master volume of the default render endpoint, expressed in `max-volume-step`
    /// equal steps. COM objects are created per call so the sink can be shared across
    /// threads.
    pub struct SystemVolume {
        limit: StepLimit,
    }

    impl SystemVolume {
        pub fn new(settings: &SettingsHandle) -> Result<Self> {
            let sink = Self { limit: StepLimit::Settings(settings.clone()) };
            // fail early when there is no endpoint at all
            sink.endpoint()?;
            Ok(sink)
        }

        fn endpoint(&self) -> Result<IAudioEndpointVolume> {
            unsafe {
                // S_FALSE / RPC_E_CHANGED_MODE just mean COM is already up on this thread
                let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
                let enumerator: IMMDeviceEnumerator = CoCreateInstance(
                    &MMDeviceEnumerator,
                    None,
                    CLSCTX_ALL
                ).map_err(map_err)?;
                let device = enumerator.GetDefaultAudioEndpoint(eRender, eConsole).map_err(map_err)?;
                device.Activate::<IAudioEndpointVolume>(CLSCTX_ALL, None).map_err(map_err)
            }
        }
    }

    fn map_err(e: windows::core::Error) -> AvcError {
        let kind = if e.code() == E_ACCESSDENIED {
            SinkFailure::PermissionDenied
        } else {
            SinkFailure::Transient
        };
        AvcError::sink(kind, e.message().to_string())
    }

    impl VolumeSink for SystemVolume {
        fn current_step(&self) -> Result<u32> {
            let endpoint = self.endpoint()?;
            let scalar = unsafe { endpoint.GetMasterVolumeLevelScalar() }.map_err(map_err)?;
            let max = self.limit.get();
            Ok(((scalar * (max as f32)).round() as u32).min(max))
        }

        fn max_step(&self) -> u32 {
            self.limit.get()
        }

        fn set_step(&self, step: u32) -> Result<()> {
            let endpoint = self.endpoint()?;
            let max = self.limit.get();
            let scalar = (step.min(max) as f32) / (max as f32);
            unsafe { endpoint.SetMasterVolumeLevelScalar(scalar, std::ptr::null()) }.map_err(map_err)
        }

        fn name(&self) -> &str {
            "system"
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub mod system {
    use super::VolumeSink;
    use crate::{ config::SettingsHandle, error::{ AvcError, Result, SinkFailure } };

    pub struct SystemVolume;

    impl SystemVolume {
        pub fn new(_settings: &SettingsHandle) -> Result<Self> {
            Err(
                AvcError::sink(
                    SinkFailure::PermissionDenied,
                    "system volume control is only available on Windows"
                )
            )
        }
    }

    impl VolumeSink for SystemVolume {
        fn current_step(&self) -> Result<u32> {
            Ok(0)
        }

        fn max_step(&self) -> u32 {
            1
        }

        fn set_step(&self, _step: u32) -> Result<()> {
            Err(AvcError::sink(SinkFailure::PermissionDenied, "unsupported platform"))
        }

        fn name(&self) -> &str {
            "system"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(old: u32, new: u32) -> VolumeChangeRecord {
        VolumeChangeRecord { timestamp: Local::now(), ambient_db: 40.0, old_volume: old, new_volume: new }
    }

    #[test]
    fn maps_ambient_onto_steps() {
        // 40 + 10 = 50 dB -> (50 - 30) / 60 = 1/3 of 15 = 5
        assert_eq!(decide(40.0, 10.0, 1, 0, 15).new_volume, 5);
        // 58 + 10 = 68 dB -> 0.6333 * 15 = 9.5 -> rounds to 10
        assert_eq!(decide(58.0, 10.0, 1, 0, 15).new_volume, 10);
    }

    #[test]
    fn respects_floor_and_ceiling() {
        assert_eq!(decide(0.0, 0.0, 1, 7, 15).new_volume, 1);
        assert_eq!(decide(200.0, 0.0, 1, 7, 15).new_volume, 15);
        assert_eq!(decide(0.0, 0.0, 4, 7, 15).new_volume, 4);
    }

    #[test]
    fn floor_above_max_is_capped() {
        assert_eq!(decide(0.0, 0.0, 30, 0, 15).new_volume, 15);
    }

    #[test]
    fn decision_is_idempotent() {
        let first = decide(52.0, 10.0, 1, 3, 15);
        let second = decide(52.0, 10.0, 1, first.new_volume, 15);
        assert_eq!(first.new_volume, second.new_volume);
        assert_eq!(first.direction(), Direction::Up);
        assert_eq!(second.direction(), Direction::Unchanged);
        assert!(!second.changed());
    }

    #[test]
    fn direction_follows_steps() {
        assert_eq!(record(3, 5).direction(), Direction::Up);
        assert_eq!(record(5, 3).direction(), Direction::Down);
        assert_eq!(record(4, 4).direction(), Direction::Unchanged);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut h = VolumeHistory::default();
        for i in 1..=60u32 {
            h.push(record(0, i));
        }
        assert_eq!(h.len(), HISTORY_CAPACITY);
        assert_eq!(h.latest().map(|r| r.new_volume), Some(60));
        assert_eq!(h.entries().last().map(|r| r.new_volume), Some(11));
    }

    #[test]
    fn software_volume_rejects_out_of_range() {
        let sink = SoftwareVolume::new(3, 15);
        assert!(sink.set_step(16).is_err());
        assert_eq!(sink.current_step().ok(), Some(3));
        sink.set_step(9).ok();
        assert_eq!(sink.current_step().ok(), Some(9));
    }

    #[test]
    fn software_volume_follows_max_volume_step() {
        let settings = SettingsHandle::default();
        let sink = SoftwareVolume::with_settings(12, &settings);
        assert_eq!(sink.max_step(), 15);
        assert!(sink.set_step(25).is_err());

        settings.set("max-volume-step", "30").unwrap();
        assert_eq!(sink.max_step(), 30);
        sink.set_step(25).unwrap();
        assert_eq!(sink.current_step().ok(), Some(25));

        settings.set("max-volume-step", "10").unwrap();
        assert_eq!(sink.current_step().ok(), Some(10));
    }

    proptest! {
        #[test]
        fn new_volume_always_in_bounds(
            ambient in -50.0f32..250.0,
            ratio in -30.0f32..30.0,
            min in 0u32..10,
            max in 1u32..100,
            current in 0u32..100,
        ) {
            let r = decide(ambient, ratio, min, current, max);
            prop_assert!(r.new_volume <= max);
            prop_assert!(r.new_volume >= min.min(max));
            prop_assert_eq!(r.old_volume, current);
        }

        #[test]
        fn history_bound_holds_for_any_count(n in 0u32..200) {
            let mut h = VolumeHistory::default();
            for i in 0..n {
                h.push(record(0, i));
                prop_assert!(h.len() <= HISTORY_CAPACITY);
            }
            prop_assert_eq!(h.len(), (n as usize).min(HISTORY_CAPACITY));
            prop_assert_eq!(h.latest().map(|r| r.new_volume), n.checked_sub(1));
        }
    }
}
