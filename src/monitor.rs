//! Monitoring session: wires the level stream into the rolling tracker and the active
//! detection mode, decides when to sample, applies volume decisions and keeps history.
//!
//! Threads per running session:
//! - the level source (capture or external feed)
//! - `tracker`: rolling percentile over every reading
//! - `gap` or `boundary`: the detection mode chosen at start
//! - short-lived `decision` threads (gap mode) and at most one `scheduled-sample`
//!
//! All of them watch one stop channel; `stop()` drops its sender and joins them.

use crossbeam_channel::{ after, bounded, select, unbounded, Receiver, Sender };
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fs::{ File, OpenOptions },
    io::Write,
    path::Path,
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread::{ self, JoinHandle },
    time::{ Duration, Instant },
};
use tracing::{ debug, info, warn };

use crate::{
    boundary::{ BoundaryEvent, BoundaryListener, BoundaryRegistry, Debouncer },
    config::{ BoundaryStrategy, SettingsHandle },
    error::{ AvcError, Result },
    gap::{ GapDetector, GapState, GapTransition },
    level::{ LevelBus, LevelSource },
    sampler::AmbientSampler,
    tracker::RollingBaselineTracker,
    volume::{ decide, VolumeChangeRecord, VolumeHistory, VolumeSink },
};

pub const CSV_HEADER: &str = "timestamp,trigger,ambient_db,old_volume,new_volume,direction,applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    Gap,
    SongBoundary,
}

impl std::fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMode::Gap => write!(f, "gap"),
            DetectionMode::SongBoundary => write!(f, "song-boundary"),
        }
    }
}

/// What produced the estimate behind a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Gap,
    /// Sampled right at a boundary event.
    SongBoundary,
    /// Cached sample taken shortly before the boundary.
    EndOfTrack,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Gap => write!(f, "gap"),
            Trigger::SongBoundary => write!(f, "song-boundary"),
            Trigger::EndOfTrack => write!(f, "end-of-track"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub trigger: Trigger,
    pub record: VolumeChangeRecord,
    /// Set when the sink refused the new step; the record still holds the intended step.
    pub sink_error: Option<String>,
}

impl DecisionOutcome {
    /// The sink was asked to change and accepted.
    pub fn applied(&self) -> bool {
        self.record.changed() && self.sink_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub running: bool,
    pub mode: Option<DetectionMode>,
    pub level_db: Option<f32>,
    pub rolling_ambient_db: f32,
    pub sampled_ambient_db: Option<f32>,
    pub gap_state: GapState,
    pub baseline_db: Option<f32>,
    pub threshold_db: f32,
    pub volume: Option<u32>,
    pub max_volume: u32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub next_sample_in_ms: Option<u64>,
    pub status_text: String,
    pub history: Vec<VolumeChangeRecord>,
}

/// Status line for a decision, in the notification wording of each mode.
pub fn status_text(mode: DetectionMode, title: Option<&str>, ambient_db: f32, volume: u32, max: u32) -> String {
    let ambient = ambient_db as i32;
    match mode {
        DetectionMode::Gap => format!("Ambient: {ambient} dB • Volume: {volume}/{max}"),
        DetectionMode::SongBoundary =>
            format!(
                "Now: {} • Ambient: {ambient} dB • Vol: {volume}/{max}",
                title.unwrap_or("Unknown")
            ),
    }
}

const IDLE_STATUS: &str = "Monitoring ambient noise...";

#[derive(Debug, Clone, Default)]
struct Status {
    mode: Option<DetectionMode>,
    sampled_ambient_db: Option<f32>,
    title: Option<String>,
    artist: Option<String>,
    text: Option<String>,
}

// ───────────────────────────────────────────────────────────────────────────────
// ScheduledSample: cancellable "sample before the track ends" task
// ───────────────────────────────────────────────────────────────────────────────

/// Handle to a pending end-of-track sample. Dropping the handle cancels the task and
/// waits for its thread, so a stale sample can never land after the handle is gone.
pub struct ScheduledSample {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fires_at: Instant,
}

impl ScheduledSample {
    fn spawn(shared: Arc<Shared>, delay: Duration) -> Result<Self> {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let fires_at = Instant::now() + delay;
        let handle = thread::Builder::new()
            .name("scheduled-sample".into())
            .spawn(move || {
                select! {
                    recv(cancel_rx) -> _ => {
                        return;
                    }
                    recv(after(delay)) -> _ => {}
                }
                info!("end-of-track: sampling ambient noise now");
                let sampler = AmbientSampler::new(shared.settings.read(|s| s.sample_duration()));
                let levels = shared.bus.subscribe();
                match sampler.sample(&levels, &cancel_rx) {
                    Some(est) => {
                        info!("end-of-track sample: {:.1} dB from {} reading(s)", est.db, est.readings);
                        *shared.pending.lock() = Some(est.db);
                    }
                    None => debug!("end-of-track sample produced no estimate"),
                }
            })?;
        Ok(Self { cancel: Some(cancel_tx), handle: Some(handle), fires_at })
    }

    pub fn fires_at(&self) -> Instant {
        self.fires_at
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledSample {
    fn drop(&mut self) {
        self.cancel.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Shared session state
// ───────────────────────────────────────────────────────────────────────────────

struct Shared {
    settings: SettingsHandle,
    sink: Arc<dyn VolumeSink>,
    bus: LevelBus,
    tracker: Mutex<RollingBaselineTracker>,
    gap: Mutex<GapDetector>,
    status: Mutex<Status>,
    history: Mutex<VolumeHistory>,
    decision_busy: AtomicBool,
    pending: Mutex<Option<f32>>,
    scheduled: Mutex<Option<ScheduledSample>>,
    csv: Mutex<Option<File>>,
    outcome_txs: Mutex<Vec<Sender<DecisionOutcome>>>,
}

/// Holds the single decision slot; released on drop.
struct DecisionSlot(Arc<Shared>);

impl Drop for DecisionSlot {
    fn drop(&mut self) {
        self.0.decision_busy.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn try_begin_decision(self: &Arc<Self>) -> Option<DecisionSlot> {
        self.decision_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DecisionSlot(self.clone()))
    }

    /// Decide, apply, record. Sink failures are logged and reported, never retried.
    fn apply_estimate(&self, trigger: Trigger, ambient_db: f32) -> DecisionOutcome {
        let settings = self.settings.get();
        let max = self.sink.max_step();
        let current = match self.sink.current_step() {
            Ok(v) => v,
            Err(e) => {
                warn!("reading current volume from {} sink failed: {e}", self.sink.name());
                self.history
                    .lock()
                    .latest()
                    .map(|r| r.new_volume)
                    .unwrap_or(0)
            }
        };

        let record = decide(
            ambient_db,
            settings.target_ratio_db,
            settings.min_volume_step,
            current,
            max
        );

        let sink_error = if record.changed() {
            match self.sink.set_step(record.new_volume) {
                Ok(()) => None,
                Err(e) => {
                    warn!("applying volume {} failed: {e}", record.new_volume);
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        info!(
            "volume decision ({trigger}): ambient {:.1} dB, {} -> {}/{} ({})",
            ambient_db,
            record.old_volume,
            record.new_volume,
            max,
            record.direction()
        );

        self.history.lock().push(record.clone());
        {
            let mut status = self.status.lock();
            status.sampled_ambient_db = Some(ambient_db);
            if let Some(mode) = status.mode {
                status.text = Some(
                    status_text(mode, status.title.as_deref(), ambient_db, record.new_volume, max)
                );
            }
        }

        let outcome = DecisionOutcome { trigger, record, sink_error };
        self.write_csv(&outcome);
        self.outcome_txs.lock().retain(|tx| tx.send(outcome.clone()).is_ok());
        outcome
    }

    fn write_csv(&self, outcome: &DecisionOutcome) {
        let mut csv = self.csv.lock();
        let Some(file) = csv.as_mut() else {
            return;
        };
        let r = &outcome.record;
        let row = writeln!(
            file,
            "{},{},{:.1},{},{},{},{}",
            r.timestamp.to_rfc3339(),
            outcome.trigger,
            r.ambient_db,
            r.old_volume,
            r.new_volume,
            r.direction(),
            outcome.applied()
        ).and_then(|_| file.flush());
        if let Err(e) = row {
            warn!("history CSV write failed: {e}");
        }
    }

    fn cancel_scheduled(&self) {
        // take first so the join below runs without the lock held
        let scheduled = self.scheduled.lock().take();
        if let Some(s) = scheduled {
            if !s.is_finished() {
                debug!("cancelling scheduled end-of-track sample");
            }
            s.cancel();
        }
    }

    fn reset(&self) {
        self.cancel_scheduled();
        self.tracker.lock().reset();
        self.gap.lock().reset();
        self.bus.clear();
        *self.pending.lock() = None;
        let mut status = self.status.lock();
        status.mode = None;
        status.title = None;
        status.artist = None;
        status.text = None;
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Workers
// ───────────────────────────────────────────────────────────────────────────────

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>> where F: FnOnce() + Send + 'static {
    Ok(thread::Builder::new().name(name.into()).spawn(f)?)
}

fn tracker_worker(shared: Arc<Shared>, stop: Receiver<()>) -> Result<JoinHandle<()>> {
    let levels = shared.bus.subscribe();
    spawn_named("tracker", move || {
        loop {
            select! {
                recv(levels.receiver()) -> msg => {
                    let Ok(reading) = msg else { break };
                    let (cap, p) = shared.settings.read(|s| (s.window_size, s.percentile));
                    let mut tracker = shared.tracker.lock();
                    tracker.set_capacity(cap);
                    tracker.set_percentile(p);
                    tracker.push(reading.db);
                }
                recv(stop) -> _ => break,
            }
        }
    })
}

type DecisionThreads = Arc<Mutex<Vec<JoinHandle<()>>>>;

fn gap_worker(shared: Arc<Shared>, stop: Receiver<()>, decisions: DecisionThreads) -> Result<JoinHandle<()>> {
    let levels = shared.bus.subscribe();
    spawn_named("gap", move || {
        loop {
            select! {
                recv(levels.receiver()) -> msg => {
                    let Ok(reading) = msg else { break };
                    let config = shared.settings.read(|s| s.gap_config());
                    let (transition, baseline, threshold) = {
                        let mut gap = shared.gap.lock();
                        gap.set_config(config);
                        let t = gap.process(reading.db, reading.captured_at);
                        (t, gap.baseline(), gap.effective_threshold())
                    };
                    match transition {
                        Some(GapTransition::GapStarted) => {
                            info!(
                                "gap detected: level {:.1} dB under threshold {:.1} dB (baseline {:.1} dB)",
                                reading.db,
                                threshold,
                                baseline.unwrap_or(0.0)
                            );
                            start_gap_decision(&shared, &stop, &decisions);
                        }
                        Some(GapTransition::MusicResumed) => debug!("music resumed at {:.1} dB", reading.db),
                        None => {}
                    }
                }
                recv(stop) -> _ => break,
            }
        }
    })
}

fn start_gap_decision(shared: &Arc<Shared>, stop: &Receiver<()>, decisions: &DecisionThreads) {
    let Some(slot) = shared.try_begin_decision() else {
        debug!("gap trigger dropped: a decision is already in flight");
        return;
    };
    let sampler = AmbientSampler::new(shared.settings.read(|s| s.sample_duration()));
    let levels = shared.bus.subscribe();
    let stop = stop.clone();
    let spawned = spawn_named("decision", move || {
        let shared = slot.0.clone();
        match sampler.sample(&levels, &stop) {
            Some(est) => {
                shared.apply_estimate(Trigger::Gap, est.db);
            }
            None => debug!("gap sample produced no estimate; skipping decision"),
        }
        drop(slot);
    });
    match spawned {
        Ok(handle) => {
            let mut threads = decisions.lock();
            threads.retain(|h| !h.is_finished());
            threads.push(handle);
        }
        Err(e) => warn!("could not start decision thread: {e}"),
    }
}

fn boundary_worker(
    shared: Arc<Shared>,
    stop: Receiver<()>,
    listener: BoundaryListener,
    strategy: BoundaryStrategy
) -> Result<JoinHandle<()>> {
    spawn_named("boundary", move || {
        let mut debouncer = Debouncer::new();
        loop {
            select! {
                recv(listener.receiver()) -> msg => {
                    let Ok(event) = msg else { break };
                    handle_boundary(&shared, &stop, &mut debouncer, strategy, event);
                }
                recv(stop) -> _ => break,
            }
        }
        // listener drops here and leaves the registry
    })
}

fn handle_boundary(
    shared: &Arc<Shared>,
    stop: &Receiver<()>,
    debouncer: &mut Debouncer,
    strategy: BoundaryStrategy,
    event: BoundaryEvent
) {
    let settings = shared.settings.get();
    {
        let mut status = shared.status.lock();
        status.title = Some(event.display_title().to_string());
        status.artist = event.artist.clone();
    }

    if !debouncer.admit(&event.identity, event.received_at, settings.debounce_window()) {
        debug!("boundary '{}': duplicate event ignored", event.identity);
        return;
    }
    info!("boundary: new track '{}'", event.identity);

    // the previous track's task can only land late from here on
    shared.cancel_scheduled();

    if let Some(_slot) = shared.try_begin_decision() {
        let pending = shared.pending.lock().take();
        let estimate = match pending {
            Some(db) if strategy == BoundaryStrategy::EndOfTrack => {
                debug!("applying end-of-track sample: {db:.1} dB");
                Some((Trigger::EndOfTrack, db))
            }
            _ => {
                debug!("no pending sample; sampling now");
                let levels = shared.bus.subscribe();
                AmbientSampler::new(settings.sample_duration())
                    .sample(&levels, stop)
                    .map(|est| (Trigger::SongBoundary, est.db))
            }
        };
        match estimate {
            Some((trigger, db)) => {
                shared.apply_estimate(trigger, db);
            }
            None => debug!("boundary sample produced no estimate; skipping decision"),
        }
    } else {
        debug!("boundary trigger dropped: a decision is already in flight");
    }

    if strategy != BoundaryStrategy::EndOfTrack {
        return;
    }
    let Some(remaining) = event.remaining() else {
        debug!("no duration for '{}'; will sample at next boundary", event.identity);
        return;
    };
    // time already spent handling this event counts against the delay
    let elapsed = event.received_at.elapsed();
    let delay = remaining.saturating_sub(settings.sample_lead()).saturating_sub(elapsed);
    info!(
        "scheduling end-of-track sample in {} ms (remaining {} ms)",
        delay.as_millis(),
        remaining.as_millis()
    );
    match ScheduledSample::spawn(shared.clone(), delay) {
        Ok(handle) => {
            *shared.scheduled.lock() = Some(handle);
        }
        Err(e) => warn!("could not schedule end-of-track sample: {e}"),
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// MonitoringSession
// ───────────────────────────────────────────────────────────────────────────────

struct Running {
    mode: DetectionMode,
    stop_tx: Sender<()>,
    threads: Vec<JoinHandle<()>>,
    decisions: DecisionThreads,
    listener_id: Option<u64>,
}

impl Running {
    fn shutdown(self) {
        let Running { stop_tx, threads, decisions, .. } = self;
        drop(stop_tx);
        for h in threads {
            let _ = h.join();
        }
        let pending: Vec<JoinHandle<()>> = decisions.lock().drain(..).collect();
        for h in pending {
            let _ = h.join();
        }
    }
}

/// One monitoring session, `Stopped -> Running -> Stopped`, restartable.
///
/// The mode is song-boundary when a [`BoundaryRegistry`] was supplied, gap otherwise.
/// History survives restarts; every other piece of state is reset on stop.
pub struct MonitoringSession {
    shared: Arc<Shared>,
    source: Arc<dyn LevelSource>,
    boundary: Option<BoundaryRegistry>,
    running: Mutex<Option<Running>>,
}

impl MonitoringSession {
    pub fn new(
        settings: SettingsHandle,
        sink: Arc<dyn VolumeSink>,
        source: Arc<dyn LevelSource>,
        boundary: Option<BoundaryRegistry>
    ) -> Self {
        let s = settings.get();
        let shared = Shared {
            tracker: Mutex::new(RollingBaselineTracker::new(s.window_size, s.percentile)),
            gap: Mutex::new(GapDetector::new(s.gap_config())),
            settings,
            sink,
            bus: LevelBus::new(),
            status: Mutex::new(Status::default()),
            history: Mutex::new(VolumeHistory::default()),
            decision_busy: AtomicBool::new(false),
            pending: Mutex::new(None),
            scheduled: Mutex::new(None),
            csv: Mutex::new(None),
            outcome_txs: Mutex::new(Vec::new()),
        };
        Self {
            shared: Arc::new(shared),
            source,
            boundary,
            running: Mutex::new(None),
        }
    }

    /// Append one CSV row per decision to `path`, writing the header into an empty file.
    pub fn with_history_csv(self, path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{CSV_HEADER}")?;
            file.flush()?;
        }
        *self.shared.csv.lock() = Some(file);
        Ok(self)
    }

    pub fn start(&self) -> Result<DetectionMode> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(AvcError::AlreadyRunning);
        }
        let mode = if self.boundary.is_some() { DetectionMode::SongBoundary } else { DetectionMode::Gap };
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut run = Running {
            mode,
            stop_tx,
            threads: Vec::new(),
            decisions: Arc::new(Mutex::new(Vec::new())),
            listener_id: None,
        };

        if let Err(e) = self.spawn_workers(&mut run, stop_rx) {
            warn!("session start failed: {e}");
            run.shutdown();
            self.shared.reset();
            return Err(e);
        }

        {
            let mut status = self.shared.status.lock();
            status.mode = Some(mode);
            status.text = Some(IDLE_STATUS.to_string());
        }
        info!("monitoring started in {mode} mode (source: {}, sink: {})", self.source.name(), self.shared.sink.name());
        *running = Some(run);
        Ok(mode)
    }

    fn spawn_workers(&self, run: &mut Running, stop_rx: Receiver<()>) -> Result<()> {
        // consumers subscribe before the source produces its first reading
        run.threads.push(tracker_worker(self.shared.clone(), stop_rx.clone())?);
        match (&self.boundary, run.mode) {
            (Some(registry), DetectionMode::SongBoundary) => {
                // fixed for the whole session
                let strategy = self.shared.settings.read(|s| s.boundary_strategy);
                info!("boundary strategy: {strategy}");
                let listener = registry.add();
                run.listener_id = Some(listener.id());
                run.threads.push(boundary_worker(self.shared.clone(), stop_rx.clone(), listener, strategy)?);
            }
            _ => {
                run.threads.push(gap_worker(self.shared.clone(), stop_rx.clone(), run.decisions.clone())?);
            }
        }
        run.threads.push(self.source.start(self.shared.bus.clone(), stop_rx)?);
        Ok(())
    }

    /// Cancel capture, pending samples and decisions, then reset detector state.
    /// Everything has finished by the time this returns.
    pub fn stop(&self) -> Result<()> {
        let Some(run) = self.running.lock().take() else {
            return Err(AvcError::NotRunning);
        };
        let mode = run.mode;
        let listener_id = run.listener_id;
        run.shutdown();
        if let (Some(registry), Some(id)) = (&self.boundary, listener_id) {
            registry.remove(id);
        }
        self.shared.reset();
        info!("monitoring stopped ({mode} mode)");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn mode(&self) -> Option<DetectionMode> {
        self.running.lock().as_ref().map(|r| r.mode)
    }

    /// Whether a sample-decide-apply sequence is in flight.
    pub fn is_deciding(&self) -> bool {
        self.shared.decision_busy.load(Ordering::SeqCst)
    }

    /// The bus readings flow through; external feeds publish here.
    pub fn bus(&self) -> LevelBus {
        self.shared.bus.clone()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.shared.settings
    }

    /// Every decision from now on is also delivered to the returned receiver.
    pub fn decisions(&self) -> Receiver<DecisionOutcome> {
        let (tx, rx) = unbounded();
        self.shared.outcome_txs.lock().push(tx);
        rx
    }

    pub fn history(&self) -> Vec<VolumeChangeRecord> {
        self.shared.history.lock().entries()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let running = self.is_running();
        let shared = &self.shared;
        let status = shared.status.lock().clone();
        let rolling_ambient_db = shared.tracker.lock().current_estimate();
        let (gap_state, baseline_db, threshold_db) = {
            let gap = shared.gap.lock();
            (gap.state(), gap.baseline(), gap.effective_threshold())
        };
        let next_sample_in_ms = shared.scheduled
            .lock()
            .as_ref()
            .filter(|s| !s.is_finished())
            .map(|s| s.fires_at().saturating_duration_since(Instant::now()).as_millis() as u64);

        MonitorSnapshot {
            running,
            mode: status.mode,
            level_db: shared.bus.latest().map(|r| r.db),
            rolling_ambient_db,
            sampled_ambient_db: status.sampled_ambient_db,
            gap_state,
            baseline_db,
            threshold_db,
            volume: shared.sink.current_step().ok(),
            max_volume: shared.sink.max_step(),
            title: status.title,
            artist: status.artist,
            next_sample_in_ms,
            status_text: status.text.unwrap_or_else(|| "Stopped".to_string()),
            history: shared.history.lock().entries(),
        }
    }
}

impl Drop for MonitoringSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
