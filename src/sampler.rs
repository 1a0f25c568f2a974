//! Timed ambient sampling with energy-domain averaging.

use crossbeam_channel::{ at, select, Receiver };
use std::time::{ Duration, Instant };
use tracing::debug;

use crate::{ gap::MAX_READING_INTERVAL, level::LevelSubscription };

pub const DEFAULT_SAMPLE_DURATION_MS: u64 = 800;

/// Result of one sampling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientEstimate {
    pub db: f32,
    pub readings: usize,
}

/// Energy average of dB readings: `20·log10(sqrt(mean(10^(db/10))))`, with the linear
/// RMS floored at 1.0 so the result is never negative.
///
/// Averaging the dB values directly would understate any loud reading in the window.
pub fn energy_average_db(readings: &[f32]) -> Option<f32> {
    if readings.is_empty() {
        return None;
    }
    let sum_sq: f64 = readings
        .iter()
        .map(|&db| {
            let linear = (10f64).powf((db as f64) / 20.0);
            linear * linear
        })
        .sum();
    let rms = (sum_sq / (readings.len() as f64)).sqrt();
    Some((20.0 * rms.max(1.0).log10()) as f32)
}

#[derive(Debug, Clone, Copy)]
pub struct AmbientSampler {
    duration: Duration,
}

impl Default for AmbientSampler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SAMPLE_DURATION_MS))
    }
}

impl AmbientSampler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Collect readings for one window and reduce them.
    ///
    /// The window spans `duration` of capture time starting at the first reading
    /// received, and is additionally bounded by `duration` of wall time so a stalled
    /// stream cannot hold the caller. Readings captured more than
    /// [`MAX_READING_INTERVAL`] before the call (the bus's retained value after a stall)
    /// are skipped. Returns `None` when no fresh reading arrived, the bus went away, or
    /// `cancel` fired (a message or a disconnect both count).
    pub fn sample(
        &self,
        levels: &LevelSubscription,
        cancel: &Receiver<()>
    ) -> Option<AmbientEstimate> {
        let opened = Instant::now();
        let oldest = opened.checked_sub(MAX_READING_INTERVAL).unwrap_or(opened);
        let deadline = at(opened + self.duration);
        let mut window_start: Option<Instant> = None;
        let mut values: Vec<f32> = Vec::new();

        loop {
            select! {
                recv(levels.receiver()) -> msg => match msg {
                    Ok(reading) if reading.captured_at < oldest => {
                        debug!(
                            "skipping stale reading captured {} ms before sampling",
                            opened.saturating_duration_since(reading.captured_at).as_millis()
                        );
                    }
                    Ok(reading) => {
                        let start = *window_start.get_or_insert(reading.captured_at);
                        if reading.captured_at.saturating_duration_since(start) >= self.duration {
                            break;
                        }
                        values.push(reading.db);
                    }
                    Err(_) => break,
                },
                recv(deadline) -> _ => break,
                recv(cancel) -> _ => {
                    debug!("ambient sample cancelled after {} reading(s)", values.len());
                    return None;
                }
            }
        }

        let db = energy_average_db(&values)?;
        Some(AmbientEstimate { db, readings: values.len() })
    }
}
