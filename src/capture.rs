//! Microphone capture through cpal, feeding block levels into a [`LevelBus`].

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use crossbeam_channel::{ after, bounded, select, Receiver, Sender };
use std::{
    thread::{ self, JoinHandle },
    time::{ Duration, Instant },
};
use tracing::{ debug, info, warn };

use crate::{
    error::{ AvcError, Result },
    level::{ block_level, f32_to_i16, LevelBus, LevelReading, LevelSource },
};

pub const PREFERRED_SAMPLE_RATE: u32 = 44_100;
pub const BLOCK_SIZE: usize = 1024;
pub const RESTART_BACKOFF: Duration = Duration::from_millis(200);

/// Events from the cpal callbacks to the capture thread.
enum Captured {
    Samples(Vec<i16>),
    Failed(String),
}

/// Default input device. One thread per session owns the cpal stream, reopens it after
/// errors and publishes one reading per `block_size` samples of the first channel.
#[derive(Debug, Clone)]
pub struct MicrophoneSource {
    preferred_rate: u32,
    block_size: usize,
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new(PREFERRED_SAMPLE_RATE, BLOCK_SIZE)
    }
}

impl MicrophoneSource {
    pub fn new(preferred_rate: u32, block_size: usize) -> Self {
        Self { preferred_rate, block_size: block_size.max(1) }
    }
}

impl LevelSource for MicrophoneSource {
    fn start(&self, bus: LevelBus, stop: Receiver<()>) -> Result<JoinHandle<()>> {
        let cfg = self.clone();
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || cfg.run(&bus, &stop))?;
        Ok(handle)
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

impl MicrophoneSource {
    fn run(&self, bus: &LevelBus, stop: &Receiver<()>) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (tx, rx) = bounded::<Captured>(32);
            let stream = match self.open(tx) {
                Ok(s) => s,
                Err(e) => {
                    warn!("capture open failed (attempt {attempt}): {e}");
                    if wait_or_stop(stop, RESTART_BACKOFF) {
                        return;
                    }
                    continue;
                }
            };

            let mut block: Vec<i16> = Vec::with_capacity(self.block_size * 2);
            let failed = loop {
                select! {
                    recv(rx) -> msg => match msg {
                        Ok(Captured::Samples(samples)) => {
                            block.extend_from_slice(&samples);
                            while block.len() >= self.block_size {
                                let db = block_level(&block, self.block_size);
                                block.drain(..self.block_size);
                                bus.publish(LevelReading::new(db, Instant::now()));
                            }
                        }
                        Ok(Captured::Failed(e)) => break Some(e),
                        Err(_) => break Some("stream callbacks went away".to_string()),
                    },
                    recv(stop) -> _ => break None,
                }
            };
            drop(stream);

            match failed {
                None => {
                    debug!("capture thread stopping");
                    return;
                }
                Some(e) => {
                    warn!("capture stream error: {e}; restarting in {} ms", RESTART_BACKOFF.as_millis());
                    attempt = 0;
                    if wait_or_stop(stop, RESTART_BACKOFF) {
                        return;
                    }
                }
            }
        }
    }

    fn open(&self, tx: Sender<Captured>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AvcError::NoInputDevice)?;
        let default_cfg = device
            .default_input_config()
            .map_err(|e| AvcError::Capture(e.to_string()))?;
        let sample_format = default_cfg.sample_format();
        let mut config = default_cfg.config();
        if let Some(sr) = maybe_rate_supported(&device, self.preferred_rate) {
            config.sample_rate.0 = sr;
        }
        let channels = config.channels.max(1) as usize;

        info!(
            "mic device: {}, {} Hz, {} channel(s), {:?}",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            channels,
            sample_format
        );

        let stream = build_input_stream(&device, &config, sample_format, channels, tx)?;
        stream.play().map_err(|e| AvcError::Capture(e.to_string()))?;
        Ok(stream)
    }
}

/// Sleep for `backoff` unless the stop signal fires first. Returns true on stop.
fn wait_or_stop(stop: &Receiver<()>, backoff: Duration) -> bool {
    select! {
        recv(stop) -> _ => true,
        recv(after(backoff)) -> _ => false,
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    channels: usize,
    tx: Sender<Captured>
) -> Result<cpal::Stream> {
    let err_tx = tx.clone();
    let err_fn = move |e: cpal::StreamError| {
        let _ = err_tx.try_send(Captured::Failed(e.to_string()));
    };

    let stream = match format {
        cpal::SampleFormat::F32 =>
            device.build_input_stream(
                config,
                move |data: &[f32], _| {
                    forward_first_channel(data, channels, &tx, |&s| f32_to_i16(s))
                },
                err_fn,
                None
            ),
        cpal::SampleFormat::I16 =>
            device.build_input_stream(
                config,
                move |data: &[i16], _| forward_first_channel(data, channels, &tx, |&s| s),
                err_fn,
                None
            ),
        cpal::SampleFormat::U16 =>
            device.build_input_stream(
                config,
                move |data: &[u16], _| {
                    forward_first_channel(data, channels, &tx, |&s| ((s as i32) - 32768) as i16)
                },
                err_fn,
                None
            ),
        other => {
            return Err(AvcError::Capture(format!("unsupported sample format {other:?}")));
        }
    };
    stream.map_err(|e| AvcError::Capture(e.to_string()))
}

/// Never blocks the audio callback; a full queue drops the chunk.
fn forward_first_channel<T>(
    data: &[T],
    channels: usize,
    tx: &Sender<Captured>,
    convert: impl Fn(&T) -> i16
) {
    let mono: Vec<i16> = data.iter().step_by(channels.max(1)).map(convert).collect();
    let _ = tx.try_send(Captured::Samples(mono));
}

fn maybe_rate_supported(device: &cpal::Device, want: u32) -> Option<u32> {
    let configs = device.supported_input_configs().ok()?;
    configs
        .into_iter()
        .any(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&want))
        .then_some(want)
}
