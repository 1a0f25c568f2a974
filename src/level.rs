//! Level computation and the fan-out bus that carries readings to every consumer.

use crossbeam_channel::{ bounded, Receiver, Sender, TrySendError };
use parking_lot::Mutex;
use std::{
    sync::{ Arc, Weak },
    thread::{ self, JoinHandle },
    time::Instant,
};

use crate::error::Result;

/// Upper bound of the proxy level scale.
pub const MAX_LEVEL_DB: f32 = 120.0;

/// Queue depth per subscriber before the oldest reading is dropped.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// One proxy level value per captured block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub db: f32,
    pub captured_at: Instant,
}

impl LevelReading {
    pub fn new(db: f32, captured_at: Instant) -> Self {
        let db = if db.is_finite() { db.clamp(0.0, MAX_LEVEL_DB) } else { 0.0 };
        Self { db, captured_at }
    }

    pub fn now(db: f32) -> Self {
        Self::new(db, Instant::now())
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// LevelMeter
// ───────────────────────────────────────────────────────────────────────────────

/// RMS of the first `valid` samples, mapped to `20·log10(rms)` and clamped to [0, 120].
/// Silence (rms == 0) yields 0 instead of -inf.
pub fn block_level(samples: &[i16], valid: usize) -> f32 {
    let n = valid.min(samples.len());
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f64 = samples[..n]
        .iter()
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    let rms = (sum_sq / (n as f64)).sqrt();
    if rms > 0.0 {
        ((20.0 * rms.log10()) as f32).clamp(0.0, MAX_LEVEL_DB)
    } else {
        0.0
    }
}

/// Scale a normalized float sample onto the signed 16-bit range.
#[inline]
pub fn f32_to_i16(s: f32) -> i16 {
    (s * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

// ───────────────────────────────────────────────────────────────────────────────
// LevelBus: single producer, many consumers, last value retained
// ───────────────────────────────────────────────────────────────────────────────

struct Subscriber {
    id: u64,
    tx: Sender<LevelReading>,
    // kept so a full queue can be drained from the producer side
    rx: Receiver<LevelReading>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    latest: Option<LevelReading>,
    next_id: u64,
}

/// Broadcast of level readings in capture order. Publishing never blocks: a subscriber
/// whose queue is full loses its oldest reading, so it always sees the newest one.
#[derive(Clone, Default)]
pub struct LevelBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LevelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// New subscriptions start with the retained last reading, if any.
    pub fn subscribe(&self) -> LevelSubscription {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock();
        if let Some(last) = inner.latest {
            let _ = tx.try_send(last);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx, rx: rx.clone() });
        LevelSubscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, reading: LevelReading) {
        let mut inner = self.inner.lock();
        inner.latest = Some(reading);
        for sub in inner.subscribers.iter() {
            match sub.tx.try_send(reading) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(r)) => {
                    let _ = sub.rx.try_recv();
                    let _ = sub.tx.try_send(r);
                }
            }
        }
    }

    pub fn latest(&self) -> Option<LevelReading> {
        self.inner.lock().latest
    }

    /// Forget the retained reading so the next session starts clean.
    pub fn clear(&self) {
        self.inner.lock().latest = None;
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Receiving end of a [`LevelBus`]; unregisters itself when dropped.
pub struct LevelSubscription {
    id: u64,
    rx: Receiver<LevelReading>,
    bus: Weak<Mutex<BusInner>>,
}

impl LevelSubscription {
    pub fn receiver(&self) -> &Receiver<LevelReading> {
        &self.rx
    }

    pub fn try_recv(&self) -> Option<LevelReading> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LevelSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Level sources
// ───────────────────────────────────────────────────────────────────────────────

/// Producer of readings for a session. `start` is called once per session start and
/// must return a thread that exits once `stop` disconnects.
pub trait LevelSource: Send + Sync {
    fn start(&self, bus: LevelBus, stop: Receiver<()>) -> Result<JoinHandle<()>>;

    fn name(&self) -> &str;
}

/// Source for embedders that publish into [`MonitoringSession::bus`](crate::monitor::MonitoringSession::bus)
/// themselves (offline replay, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalFeed;

impl LevelSource for ExternalFeed {
    fn start(&self, _bus: LevelBus, stop: Receiver<()>) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("external-feed".into())
            .spawn(move || {
                // only parks until the session stops
                let _ = stop.recv();
            })?;
        Ok(handle)
    }

    fn name(&self) -> &str {
        "external"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_block_is_zero_db() {
        assert_eq!(block_level(&[0; 512], 512), 0.0);
        assert_eq!(block_level(&[], 0), 0.0);
    }

    #[test]
    fn full_scale_square_wave_level() {
        let block: Vec<i16> = (0..1024)
            .map(|i| if i % 2 == 0 { 32767 } else { -32767 })
            .collect();
        let db = block_level(&block, block.len());
        assert!((db - 90.3).abs() < 0.05, "got {db}");
    }

    #[test]
    fn only_valid_samples_count() {
        let mut block = vec![1000i16; 256];
        block.extend(std::iter::repeat(0).take(256));
        assert!((block_level(&block, 256) - 60.0).abs() < 1e-3);
    }

    #[test]
    fn readings_are_clamped() {
        assert_eq!(LevelReading::now(-5.0).db, 0.0);
        assert_eq!(LevelReading::now(500.0).db, MAX_LEVEL_DB);
        assert_eq!(LevelReading::now(f32::NAN).db, 0.0);
    }

    #[test]
    fn new_subscriber_sees_latest_value() {
        let bus = LevelBus::new();
        bus.publish(LevelReading::now(42.0));
        let sub = bus.subscribe();
        assert_eq!(sub.try_recv().map(|r| r.db), Some(42.0));
    }

    #[test]
    fn slow_subscriber_keeps_newest_readings() {
        let bus = LevelBus::new();
        let sub = bus.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.publish(LevelReading::now(i as f32));
        }
        let got: Vec<f32> = sub.receiver().try_iter().map(|r| r.db).collect();
        assert_eq!(got.len(), SUBSCRIBER_QUEUE);
        assert_eq!(got.first().copied(), Some(10.0));
        assert_eq!(got.last().copied(), Some((SUBSCRIBER_QUEUE + 9) as f32));
        assert!(got.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn dropped_subscription_unregisters() {
        let bus = LevelBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(a);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn clear_forgets_retained_value() {
        let bus = LevelBus::new();
        bus.publish(LevelReading::now(50.0));
        bus.clear();
        assert!(bus.latest().is_none());
        assert!(bus.subscribe().try_recv().is_none());
    }
}
