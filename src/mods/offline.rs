use ambient_volume::{
    capture::BLOCK_SIZE,
    config::SettingsHandle,
    decode,
    level::{ ExternalFeed, LevelReading },
    monitor::{ DecisionOutcome, MonitoringSession },
    volume::SoftwareVolume,
};
use anyhow::{ Context, Result };
use std::{
    path::Path,
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread,
    time::{ Duration, Instant },
};
use tracing::info;

use crate::Cli;

fn clock(offset: Duration) -> String {
    let s = offset.as_secs_f64();
    format!("{:02}:{:04.1}", (s / 60.0).floor() as u64, s % 60.0)
}

fn print_outcome(at: Duration, o: &DecisionOutcome) {
    let r = &o.record;
    println!(
        "[{}] gap: ambient {:.1} dB, volume {} -> {} ({})",
        clock(at),
        r.ambient_db,
        r.old_volume,
        r.new_volume,
        r.direction()
    );
}

/// Instant that audio offset zero is stamped with. Below real time the stamps start
/// ahead of the clock by the total slowdown, so no reading is ever stamped before the
/// moment it is published.
fn stamp_base(t0: Instant, audio_end: Duration, speed: f64) -> Result<Instant> {
    if speed >= 1.0 {
        return Ok(t0);
    }
    Duration::try_from_secs_f64(audio_end.as_secs_f64() * (1.0 / speed - 1.0))
        .ok()
        .and_then(|lead| t0.checked_add(lead))
        .with_context(|| format!("--replay-speed {speed} is too slow for {:.1} s of audio", audio_end.as_secs_f64()))
}

/// Offline mode: replay a local audio file (WAV/MP3/FLAC/OGG/M4A) through a gap-mode
/// session with a software sink. Readings carry audio-time stamps, so detection timing
/// matches the recording whatever the replay speed.
pub fn run_offline(cli: &Cli, settings: SettingsHandle) -> Result<()> {
    let Some(input) = cli.input.as_deref() else {
        anyhow::bail!("--input <PATH> is required in offline mode");
    };
    let path = Path::new(input);
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }
    let speed = cli.replay_speed;
    if !(speed.is_finite() && speed > 0.0) {
        anyhow::bail!("--replay-speed must be greater than zero (got {speed})");
    }

    info!("decoding: {}", path.display());
    let track = decode::decode_levels(path, BLOCK_SIZE).with_context(|| format!("decoding {}", path.display()))?;
    info!(
        "decoded: sr={} Hz, channels={}, frames={}, {:.1} s, {} block(s)",
        track.sr,
        track.channels,
        track.frames,
        track.duration().as_secs_f32(),
        track.levels.len()
    );
    let levels = track.levels;
    let audio_end = levels.last().map_or(Duration::ZERO, |(offset, _)| *offset);

    // ctrl+c to quit
    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = quit.clone();
        let _ = ctrlc::set_handler(move || {
            q.store(true, Ordering::SeqCst);
        });
    }

    let sink = Arc::new(SoftwareVolume::with_settings(cli.initial_volume, &settings));
    let mut session = MonitoringSession::new(settings.clone(), sink, Arc::new(ExternalFeed), None);
    if let Some(csv) = &cli.history_csv {
        session = session
            .with_history_csv(csv)
            .with_context(|| format!("opening history CSV {}", csv.display()))?;
    }
    let decisions = session.decisions();
    session.start()?;
    let bus = session.bus();

    println!("replaying {} at {speed}x ({} blocks)", path.display(), levels.len());
    let t0 = Instant::now();
    let base = stamp_base(t0, audio_end, speed)?;
    let mut count = 0usize;
    let mut position = Duration::ZERO;
    for (offset, db) in levels {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let due = t0 + offset.div_f64(speed);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        bus.publish(LevelReading::new(db, base + offset));
        position = offset;
        for outcome in decisions.try_iter() {
            count += 1;
            print_outcome(position, &outcome);
        }
    }

    // let an in-flight sample at the very end finish
    let grace = Instant::now() + settings.read(|s| s.sample_duration()) * 2;
    while session.is_deciding() && Instant::now() < grace {
        thread::sleep(Duration::from_millis(20));
    }
    let snapshot = session.snapshot();
    session.stop()?;
    for outcome in decisions.try_iter() {
        count += 1;
        print_outcome(position, &outcome);
    }

    println!(
        "replayed {} of audio: {count} gap decision(s), final volume {}/{}, rolling ambient {:.1} dB",
        clock(position),
        snapshot.volume.unwrap_or(0),
        snapshot.max_volume,
        snapshot.rolling_ambient_db
    );
    info!("offline replay done: {count} decision(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_stamps_never_trail_publish_time() {
        let t0 = Instant::now();
        let end = Duration::from_secs(60);
        for speed in [0.25, 0.5, 1.0, 4.0] {
            let base = stamp_base(t0, end, speed).unwrap();
            for secs in [0u64, 10, 30, 60] {
                let offset = Duration::from_secs(secs);
                let published = t0 + offset.div_f64(speed);
                assert!(base + offset >= published, "speed {speed}, offset {secs} s");
            }
        }
        assert_eq!(stamp_base(t0, end, 2.0).unwrap(), t0);
    }

    #[test]
    fn clock_formats_minutes_and_tenths() {
        assert_eq!(clock(Duration::from_millis(83_420)), "01:23.4");
        assert_eq!(clock(Duration::ZERO), "00:00.0");
    }
}
