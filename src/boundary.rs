//! Song-boundary events: wire format, listener registry, debounce and a JSON-lines source.

use crossbeam_channel::{ unbounded, Receiver, Sender };
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{ self, BufRead, BufReader },
    path::{ Path, PathBuf },
    sync::{ Arc, Weak },
    thread::{ self, JoinHandle },
    time::{ Duration, Instant },
};
use tracing::{ debug, info, warn };

use crate::error::{ AvcError, Result };

/// A "song changed" notification from a media player.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryEvent {
    /// Stable key used for duplicate suppression.
    pub identity: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub estimated_duration_ms: Option<u64>,
    pub position_ms: Option<u64>,
    pub received_at: Instant,
}

impl BoundaryEvent {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            title: None,
            artist: None,
            estimated_duration_ms: None,
            position_ms: None,
            received_at: Instant::now(),
        }
    }

    pub fn with_timing(mut self, duration_ms: u64, position_ms: u64) -> Self {
        self.estimated_duration_ms = Some(duration_ms);
        self.position_ms = Some(position_ms);
        self
    }

    pub fn received_at(mut self, at: Instant) -> Self {
        self.received_at = at;
        self
    }

    /// Time left until the predicted next boundary, when the player reported a duration.
    /// A missing position counts as the start of the track.
    pub fn remaining(&self) -> Option<Duration> {
        let duration = self.estimated_duration_ms.filter(|d| *d > 0)?;
        let position = self.position_ms.unwrap_or(0);
        Some(Duration::from_millis(duration.saturating_sub(position)))
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.identity)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default, alias = "estimated_duration_ms", alias = "durationMs")]
    estimated_duration_ms: Option<u64>,
    #[serde(default, alias = "position_ms")]
    position_ms: Option<u64>,
}

/// Parse one JSON line, e.g.
/// `{"title":"Song","artist":"Band","estimatedDurationMs":215000,"positionMs":1200}`.
///
/// Without an explicit `identity` the key is `"artist - title"`, or the title alone.
pub fn parse_line(line: &str) -> Result<BoundaryEvent> {
    let wire: WireEvent = serde_json::from_str(line)?;
    let identity = match (&wire.identity, &wire.artist, &wire.title) {
        (Some(id), _, _) if !id.trim().is_empty() => id.trim().to_string(),
        (_, Some(artist), Some(title)) if !artist.is_empty() => format!("{artist} - {title}"),
        (_, _, Some(title)) if !title.is_empty() => title.clone(),
        _ => {
            return Err(AvcError::BoundarySource("event carries neither identity nor title".into()));
        }
    };
    Ok(BoundaryEvent {
        identity,
        title: wire.title,
        artist: wire.artist,
        estimated_duration_ms: wire.estimated_duration_ms,
        position_ms: wire.position_ms,
        received_at: Instant::now(),
    })
}

// ───────────────────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────────────────

type Listeners = Mutex<BTreeMap<u64, Sender<BoundaryEvent>>>;

/// Fan-out of boundary events to the listeners that are currently registered.
#[derive(Clone, Default)]
pub struct BoundaryRegistry {
    listeners: Arc<Listeners>,
    next_id: Arc<Mutex<u64>>,
}

impl BoundaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> BoundaryListener {
        let (tx, rx) = unbounded();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.listeners.lock().insert(id, tx);
        debug!("boundary listener {id} registered");
        BoundaryListener {
            id,
            rx,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        let removed = self.listeners.lock().remove(&id).is_some();
        if removed {
            debug!("boundary listener {id} removed");
        }
        removed
    }

    /// Deliver to every listener. Returns how many received it.
    pub fn emit(&self, event: BoundaryEvent) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Registration handle; dropping it unregisters.
pub struct BoundaryListener {
    id: u64,
    rx: Receiver<BoundaryEvent>,
    registry: Weak<Listeners>,
}

impl BoundaryListener {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<BoundaryEvent> {
        &self.rx
    }
}

impl Drop for BoundaryListener {
    fn drop(&mut self) {
        if let Some(listeners) = self.registry.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Debounce
// ───────────────────────────────────────────────────────────────────────────────

/// Suppresses a repeat of the last handled identity inside the window. Times come from
/// the events themselves so bursts are judged by arrival, not by processing delay.
#[derive(Debug, Default, Clone)]
pub struct Debouncer {
    last: Option<(String, Instant)>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, identity: &str, at: Instant, window: Duration) -> bool {
        if let Some((last_id, last_at)) = &self.last {
            if last_id == identity && at.saturating_duration_since(*last_at) < window {
                return false;
            }
        }
        self.last = Some((identity.to_string(), at));
        true
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// JSON-lines source
// ───────────────────────────────────────────────────────────────────────────────

/// Reads newline-delimited JSON events from a file, FIFO or stdin (`-`).
pub struct JsonLinesBoundarySource {
    path: PathBuf,
}

impl JsonLinesBoundarySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn is_stdin(&self) -> bool {
        self.path.as_os_str() == "-"
    }

    /// Start the reader thread. It ends at end of input.
    pub fn spawn(self, registry: BoundaryRegistry) -> Result<JoinHandle<()>> {
        let reader: Box<dyn BufRead + Send> = if self.is_stdin() {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(&self.path).map_err(|e| {
                AvcError::BoundarySource(format!("{}: {e}", self.path.display()))
            })?;
            Box::new(BufReader::new(file))
        };
        let label = self.path.display().to_string();
        let handle = thread::Builder::new()
            .name("boundary-source".into())
            .spawn(move || pump(reader, &registry, &label))?;
        Ok(handle)
    }
}

fn pump(reader: impl BufRead, registry: &BoundaryRegistry, label: &str) {
    info!("reading boundary events from {label}");
    for (n, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("boundary source {label}: read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(event) => {
                let delivered = registry.emit(event);
                if delivered == 0 {
                    debug!("boundary event on line {} had no listener", n + 1);
                }
            }
            Err(e) => warn!("boundary source {label}: skipping line {}: {e}", n + 1),
        }
    }
    info!("boundary source {label} reached end of input");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_falls_back_to_artist_and_title() {
        let e = parse_line(r#"{"title":"Blue","artist":"Joni","estimatedDurationMs":180000,"positionMs":500}"#)
            .unwrap();
        assert_eq!(e.identity, "Joni - Blue");
        assert_eq!(e.remaining(), Some(Duration::from_millis(179_500)));

        let e = parse_line(r#"{"title":"Blue"}"#).unwrap();
        assert_eq!(e.identity, "Blue");
        assert_eq!(e.remaining(), None);

        let e = parse_line(r#"{"identity":"track:42","title":"Blue"}"#).unwrap();
        assert_eq!(e.identity, "track:42");
    }

    #[test]
    fn rejects_events_without_identity() {
        assert!(parse_line(r#"{"positionMs":5}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn position_past_duration_means_now() {
        let e = BoundaryEvent::new("x").with_timing(1000, 5000);
        assert_eq!(e.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn debounce_uses_event_times() {
        let mut d = Debouncer::new();
        let t = Instant::now();
        let w = Duration::from_millis(3000);
        assert!(d.admit("a", t, w));
        assert!(!d.admit("a", t + Duration::from_millis(500), w));
        assert!(d.admit("a", t + Duration::from_millis(3100), w));
        // a different identity always passes
        assert!(d.admit("b", t + Duration::from_millis(3200), w));
        assert!(d.admit("a", t + Duration::from_millis(3300), w));
    }

    #[test]
    fn registry_lifecycle() {
        let reg = BoundaryRegistry::new();
        let a = reg.add();
        let b = reg.add();
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.emit(BoundaryEvent::new("x")), 2);
        assert!(reg.remove(a.id()));
        assert!(!reg.remove(a.id()));
        drop(b);
        assert_eq!(reg.listener_count(), 0);
        assert_eq!(reg.emit(BoundaryEvent::new("y")), 0);
        assert_eq!(a.receiver().try_iter().count(), 1);
    }

    #[test]
    fn pump_skips_malformed_lines() {
        let reg = BoundaryRegistry::new();
        let l = reg.add();
        let input = "{\"title\":\"One\"}\n\ngarbage\n{\"title\":\"Two\"}\n";
        pump(input.as_bytes(), &reg, "test");
        let ids: Vec<String> = l.receiver().try_iter().map(|e| e.identity).collect();
        assert_eq!(ids, vec!["One".to_string(), "Two".to_string()]);
    }
}
