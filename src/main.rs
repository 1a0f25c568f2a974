//! src/main.rs

use ambient_volume::{
    config::{ BoundaryStrategy, Settings, SettingsHandle },
    volume::{ system::SystemVolume, SoftwareVolume, VolumeSink },
};
use anyhow::{ Context, Result };
use clap::{ Parser, ValueEnum };
use std::{ env, path::PathBuf, sync::Arc };
use tracing::warn;

mod logger;
use crate::logger::LogLevel;

// expose the split mode files in src/mods/
mod mods;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Microphone capture with live volume control
    Live,
    /// Replay a recorded file through gap detection
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// In-process step counter
    Software,
    /// Master volume of the default output device (Windows)
    System,
}

fn default_log_path() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("build")
        .join("AmbientVolume.log")
}

#[derive(Debug, Parser)]
#[command(
    name = "ambient-volume",
    version,
    about = "Estimates room noise between songs and keeps playback volume above it",
    allow_negative_numbers = true
)]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Live)]
    pub mode: Mode,

    /// Log file (appended)
    #[arg(long, env = "AMBIENT_VOLUME_LOG", default_value_os_t = default_log_path())]
    pub log_path: PathBuf,

    /// debug, info, warning, error
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// JSON settings file used as the starting point; flags below override it
    #[arg(long, env = "AMBIENT_VOLUME_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Append one row per volume decision
    #[arg(long)]
    pub history_csv: Option<PathBuf>,

    /// Audio file for offline mode (wav/mp3/flac/ogg/m4a)
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Offline pacing; 1.0 is real time
    #[arg(long, default_value_t = 1.0)]
    pub replay_speed: f64,

    /// JSON-lines song-boundary events (file, FIFO or `-` for stdin); enables song-boundary mode
    #[arg(long)]
    pub boundary_events: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SinkKind::Software)]
    pub volume_sink: SinkKind,

    /// Starting step of the software sink
    #[arg(long, default_value_t = 0)]
    pub initial_volume: u32,

    #[arg(long)]
    pub window_size: Option<usize>,
    #[arg(long)]
    pub percentile: Option<f32>,
    #[arg(long)]
    pub absolute_floor_db: Option<f32>,
    #[arg(long)]
    pub drop_db: Option<f32>,
    #[arg(long)]
    pub silence_duration_ms: Option<u64>,
    #[arg(long)]
    pub sample_duration_ms: Option<u64>,
    #[arg(long)]
    pub target_ratio_db: Option<f32>,
    #[arg(long)]
    pub min_volume_step: Option<u32>,
    #[arg(long)]
    pub debounce_window_ms: Option<u64>,
    #[arg(long)]
    pub sample_lead_ms: Option<u64>,
    #[arg(long)]
    pub max_volume_step: Option<u32>,
    #[arg(long, value_enum)]
    pub boundary_strategy: Option<BoundaryStrategy>,
}

impl Cli {
    /// Settings file (or defaults) with every given flag applied on top.
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) =>
                Settings::from_json_file(path).with_context(|| {
                    format!("loading settings from {}", path.display())
                })?,
            None => Settings::default(),
        };

        let overrides: [(&str, Option<String>); 12] = [
            ("window-size", self.window_size.map(|v| v.to_string())),
            ("percentile", self.percentile.map(|v| v.to_string())),
            ("absolute-floor-db", self.absolute_floor_db.map(|v| v.to_string())),
            ("drop-db", self.drop_db.map(|v| v.to_string())),
            ("silence-duration-ms", self.silence_duration_ms.map(|v| v.to_string())),
            ("sample-duration-ms", self.sample_duration_ms.map(|v| v.to_string())),
            ("target-ratio-db", self.target_ratio_db.map(|v| v.to_string())),
            ("min-volume-step", self.min_volume_step.map(|v| v.to_string())),
            ("debounce-window-ms", self.debounce_window_ms.map(|v| v.to_string())),
            ("sample-lead-ms", self.sample_lead_ms.map(|v| v.to_string())),
            ("max-volume-step", self.max_volume_step.map(|v| v.to_string())),
            ("boundary-strategy", self.boundary_strategy.map(|v| v.to_string())),
        ];
        for (key, value) in overrides {
            if let Some(value) = value {
                settings.set(key, &value).with_context(|| format!("--{key}"))?;
            }
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// The requested sink, or the software one when the platform refuses. Both follow
/// `max-volume-step` as it changes.
pub fn build_sink(kind: SinkKind, settings: &SettingsHandle, initial: u32) -> Arc<dyn VolumeSink> {
    match kind {
        SinkKind::Software => Arc::new(SoftwareVolume::with_settings(initial, settings)),
        SinkKind::System =>
            match SystemVolume::new(settings) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    warn!("system volume unavailable ({e}); using software volume");
                    Arc::new(SoftwareVolume::with_settings(initial, settings))
                }
            }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// main
// ───────────────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let cli = Cli::parse();

    logger::init(&cli.log_path, cli.log_level)?;

    let settings = SettingsHandle::new(cli.settings()?);

    match cli.mode {
        Mode::Live => mods::live::run_live(&cli, settings),
        Mode::Offline => mods::offline::run_offline(&cli, settings),
    }
}
