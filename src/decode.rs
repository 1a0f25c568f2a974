//! File decoding for offline replay: WAV/MP3/FLAC/OGG/MP4 (AAC) via symphonia, metered
//! into one level per block of the first channel as packets come off the decoder.

use std::{ fs::File, path::Path, time::Duration };
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{ CodecParameters, DecoderOptions },
    errors::Error,
    formats::{ FormatOptions, FormatReader },
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use symphonia::default::{ get_codecs, get_probe };

use crate::{ error::{ AvcError, Result }, level::block_level };

/// Block levels of a decoded recording.
#[derive(Debug, Clone)]
pub struct LevelTrack {
    pub sr: u32,
    pub channels: u16,
    /// Frames decoded from the first channel, including a trailing partial block.
    pub frames: u64,
    /// `(block start offset, level dB)` in recording order.
    pub levels: Vec<(Duration, f32)>,
}

impl LevelTrack {
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames, self.sr)
    }
}

fn frames_to_duration(frames: u64, sr: u32) -> Duration {
    Duration::from_secs_f64((frames as f64) / (sr.max(1) as f64))
}

/// Accumulates first-channel samples across packet boundaries and meters each full
/// block. A trailing partial block is never metered.
struct BlockMeter {
    sr: u32,
    block_size: usize,
    block: Vec<i16>,
    frames: u64,
    levels: Vec<(Duration, f32)>,
}

impl BlockMeter {
    fn new(sr: u32, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            sr,
            block_size,
            block: Vec::with_capacity(block_size),
            frames: 0,
            levels: Vec::new(),
        }
    }

    fn feed(&mut self, samples: impl IntoIterator<Item = i16>) {
        for s in samples {
            self.block.push(s);
            self.frames += 1;
            if self.block.len() == self.block_size {
                let start = self.frames - (self.block_size as u64);
                let db = block_level(&self.block, self.block_size);
                self.levels.push((frames_to_duration(start, self.sr), db));
                self.block.clear();
            }
        }
    }

    fn finish(self, channels: u16) -> LevelTrack {
        LevelTrack {
            sr: self.sr,
            channels,
            frames: self.frames,
            levels: self.levels,
        }
    }
}

fn decode_err(e: Error) -> AvcError {
    AvcError::Decode(e.to_string())
}

fn open(path: &Path) -> Result<(Box<dyn FormatReader>, u32, CodecParameters)> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(decode_err)?;
    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| AvcError::Decode("no default audio track found".into()))?;
    let (track_id, params) = (track.id, track.codec_params.clone());
    Ok((format, track_id, params))
}

/// Decode `path` and meter its first channel in blocks of `block_size` frames.
pub fn decode_levels<P: AsRef<Path>>(path: P, block_size: usize) -> Result<LevelTrack> {
    let (mut format, track_id, params) = open(path.as_ref())?;

    let mut decoder = get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(decode_err)?;
    let sr = params.sample_rate.ok_or_else(|| AvcError::Decode("unknown sample rate".into()))?;
    let channels = params.channels.map(|c| c.count() as u16).unwrap_or(1u16);

    let mut meter = BlockMeter::new(sr, block_size);
    let mut sample_buf: Option<SampleBuffer<i16>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(err) => {
                return Err(decode_err(err));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // corrupt frame, keep going
            Err(Error::DecodeError(_)) => {
                continue;
            }
            Err(err) => {
                return Err(decode_err(err));
            }
        };

        let spec = *decoded.spec();
        let stride = spec.channels.count().max(1);
        if sample_buf.as_ref().map_or(true, |b| b.capacity() < decoded.capacity()) {
            sample_buf = Some(SampleBuffer::<i16>::new(decoded.capacity() as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);
        meter.feed(buf.samples().iter().step_by(stride).copied());
    }

    Ok(meter.finish(channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_span_packet_boundaries() {
        let mut meter = BlockMeter::new(1000, 1000);
        // 2500 frames at half scale, delivered in uneven packets
        for n in [700usize, 700, 700, 400] {
            meter.feed(std::iter::repeat(16384i16).take(n));
        }
        let track = meter.finish(2);
        assert_eq!(track.levels.len(), 2);
        assert_eq!(track.levels[0].0, Duration::ZERO);
        assert_eq!(track.levels[1].0, Duration::from_secs(1));
        // 16384 -> ~84.3 dB
        assert!((track.levels[0].1 - 84.3).abs() < 0.1, "got {}", track.levels[0].1);
        assert_eq!(track.duration(), Duration::from_millis(2500));
        assert_eq!(track.channels, 2);
    }

    #[test]
    fn silence_meters_zero() {
        let mut meter = BlockMeter::new(4, 4);
        meter.feed([0i16; 10]);
        let track = meter.finish(1);
        // the trailing two frames never fill a block
        assert_eq!(track.levels, vec![(Duration::ZERO, 0.0), (Duration::from_secs(1), 0.0)]);
        assert_eq!(track.frames, 10);
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(decode_levels("/nonexistent/clip.wav", 1024), Err(AvcError::Io(_))));
    }
}
