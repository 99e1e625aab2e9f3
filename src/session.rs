//! Capture session lifecycle and delegate dispatch.

use crate::negotiate::negotiate;
use crate::sensor::{ConnectionEvent, ConnectionMonitor, SensorLink, SensorManager};
use crate::sync::{FrameSynchronizer, SyncConfig};
use crate::types::{ConnectionState, Modality, SessionState, StreamProfile, SynchronizedFramePair};
use crate::{CaptureError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Callbacks delivered to the consumer (the presentation layer).
///
/// Invoked on a dedicated dispatch thread, never on the sensor reader
/// thread, so a slow delegate cannot stall frame ingestion. Ownership of
/// each [`SynchronizedFramePair`] transfers on delivery.
pub trait CaptureDelegate: Send {
    fn on_frame(&mut self, pair: SynchronizedFramePair);

    fn on_state_change(&mut self, old: SessionState, new: SessionState);

    fn on_error(&mut self, error: &CaptureError);

    /// A frame left the synchronizer unpaired. Diagnostic only.
    fn on_frame_dropped(&mut self, _modality: Modality, _timestamp_us: u64) {}
}

/// Session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Synchronizer tolerance settings.
    pub sync: SyncConfig,
    /// Delegate event channel depth. Frames beyond it are dropped, not queued.
    pub channel_capacity: usize,
    /// Poll interval for interrupt reads; bounds stop latency.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            channel_capacity: 256,
            read_timeout: Duration::from_millis(100),
        }
    }
}

enum DelegateEvent {
    Frame(SynchronizedFramePair),
    Dropped(Modality, u64),
    StateChange(SessionState, SessionState),
    Error(CaptureError),
}

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_PAUSED: u8 = 3;
const STATE_STOPPING: u8 = 4;
const STATE_FAILED: u8 = 5;

fn encode_state(s: &SessionState) -> u8 {
    match s {
        SessionState::Idle => STATE_IDLE,
        SessionState::Starting => STATE_STARTING,
        SessionState::Running => STATE_RUNNING,
        SessionState::Paused => STATE_PAUSED,
        SessionState::Stopping => STATE_STOPPING,
        SessionState::Failed(_) => STATE_FAILED,
    }
}

/// Single-writer session state with lock-free discriminant reads.
/// The failure reason only matters in the Failed state and is read rarely.
struct SharedState {
    discriminant: AtomicU8,
    fail_reason: Mutex<String>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            discriminant: AtomicU8::new(STATE_IDLE),
            fail_reason: Mutex::new(String::new()),
        }
    }

    fn decode(v: u8, reason: &str) -> SessionState {
        match v {
            STATE_STARTING => SessionState::Starting,
            STATE_RUNNING => SessionState::Running,
            STATE_PAUSED => SessionState::Paused,
            STATE_STOPPING => SessionState::Stopping,
            STATE_FAILED => SessionState::Failed(reason.to_string()),
            _ => SessionState::Idle,
        }
    }

    fn snapshot(&self) -> SessionState {
        let v = self.discriminant.load(Ordering::Acquire);
        if v == STATE_FAILED {
            let reason = self
                .fail_reason
                .lock()
                .map(|r| r.clone())
                .unwrap_or_default();
            SessionState::Failed(reason)
        } else {
            Self::decode(v, "")
        }
    }

    fn is_running(&self) -> bool {
        self.discriminant.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn is_paused(&self) -> bool {
        self.discriminant.load(Ordering::Acquire) == STATE_PAUSED
    }

    /// Replace the state, returning the previous one. Writers (session
    /// methods and the reader's failure path) serialize on the reason lock;
    /// snapshot readers stay lock-free on the discriminant.
    fn swap(&self, new: &SessionState) -> SessionState {
        let mut reason = match self.fail_reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let old = Self::decode(self.discriminant.load(Ordering::Acquire), &reason);
        if let SessionState::Failed(r) = new {
            *reason = r.clone();
        }
        self.discriminant.store(encode_state(new), Ordering::Release);
        old
    }
}

/// Orchestrates sensor acquisition, profile negotiation, frame
/// synchronization, and delegate dispatch into one lifecycle:
///
/// Idle -> Starting -> Running -> {Paused <-> Running} -> Stopping -> Idle,
/// with Starting/Running -> Failed on unrecoverable sensor errors and
/// Failed -> Idle via [`reset`](CaptureSession::reset).
///
/// A reader thread drives sensor I/O and the synchronizer; a dispatch thread
/// invokes the delegate. `stop()` joins both, so once it returns no further
/// callbacks occur. A handle from [`stop_signal`](CaptureSession::stop_signal)
/// makes an in-flight `start()` abandon cleanly from another thread.
pub struct CaptureSession {
    manager: SensorManager,
    config: SessionConfig,
    shared: Arc<SharedState>,
    stop_flag: Arc<AtomicBool>,
    delegate: Option<Box<dyn CaptureDelegate>>,
    events_tx: Option<Sender<DelegateEvent>>,
    reader: Option<std::thread::JoinHandle<Option<Box<dyn SensorLink>>>>,
    dispatcher: Option<std::thread::JoinHandle<Box<dyn CaptureDelegate>>>,
    profile: Option<StreamProfile>,
}

impl CaptureSession {
    pub fn new(
        manager: SensorManager,
        delegate: Box<dyn CaptureDelegate>,
        config: SessionConfig,
    ) -> Self {
        Self {
            manager,
            config,
            shared: Arc::new(SharedState::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            delegate: Some(delegate),
            events_tx: None,
            reader: None,
            dispatcher: None,
            profile: None,
        }
    }

    /// Lock-free snapshot of the session state.
    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    /// The profile negotiated by the last successful `start()`.
    pub fn profile(&self) -> Option<StreamProfile> {
        self.profile
    }

    /// Connection state of the underlying sensor.
    pub fn sensor_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Receiver for sensor connection-state transitions. Single consumer.
    pub fn connection_events(&self) -> Receiver<ConnectionEvent> {
        self.manager.subscribe()
    }

    /// Flag that aborts an in-flight `start()` from another thread. The
    /// abandoned `start()` tears down whatever it had acquired and returns
    /// `InvalidState`; no callbacks fire afterwards.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Acquire the sensor, negotiate `requested`, and begin streaming.
    ///
    /// Valid from Idle or Failed (the latter resets first). Returns the
    /// negotiated profile. On failure the session lands in Failed with the
    /// error returned here; no separate `on_error` fires for the same fault.
    pub fn start(&mut self, requested: StreamProfile) -> Result<StreamProfile> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Failed(_) => self.reset()?,
            other => {
                return Err(CaptureError::InvalidState {
                    op: "start",
                    state: other.name(),
                })
            }
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        self.spawn_dispatcher()?;
        self.transition(SessionState::Starting);

        match self.start_streaming(&requested) {
            Ok(profile) => {
                self.profile = Some(profile);
                log::info!(
                    "Capture session running: {}@{}fps depth={:?} color={:?}",
                    profile.resolution,
                    profile.frame_rate,
                    profile.depth_mode,
                    profile.color_mode
                );
                Ok(profile)
            }
            Err(e) => {
                self.manager.disconnect();
                let aborted = matches!(
                    e,
                    CaptureError::InvalidState {
                        op: "start",
                        state: "Stopping",
                    }
                );
                if aborted {
                    // Concurrent stop during start is orderly, not a fault.
                    self.transition(SessionState::Idle);
                } else {
                    self.transition(SessionState::Failed(format!("{}: {}", e.kind(), e)));
                }
                self.join_dispatcher();
                Err(e)
            }
        }
    }

    fn start_streaming(&mut self, requested: &StreamProfile) -> Result<StreamProfile> {
        let mut link = self.manager.connect()?;

        if self.stop_flag.load(Ordering::SeqCst) {
            log::info!("Start abandoned by concurrent stop");
            drop(link);
            self.manager.disconnect();
            return Err(CaptureError::InvalidState {
                op: "start",
                state: "Stopping",
            });
        }

        let profile = negotiate(requested, link.capability_table(), link.capabilities())?;
        link.start_streams(&profile)?;

        let monitor = self.manager.monitor();
        monitor.mark_streaming();

        let tolerance_us = self.config.sync.tolerance_for(&profile);
        let synchronizer = FrameSynchronizer::new(tolerance_us);
        log::info!("Frame pairing tolerance: {}us", tolerance_us);

        let events_tx = self
            .events_tx
            .clone()
            .ok_or_else(|| CaptureError::InternalFailure("dispatcher not running".into()))?;
        let shared = self.shared.clone();
        let stop_flag = self.stop_flag.clone();
        let read_timeout = self.config.read_timeout;

        // Running must be visible before the reader starts, or its first
        // frames would be discarded by the state guard.
        self.transition(SessionState::Running);

        let reader = std::thread::Builder::new()
            .name("depthcap-reader".into())
            .spawn(move || {
                reader_loop(link, synchronizer, events_tx, shared, stop_flag, monitor, read_timeout)
            })
            .map_err(|e| {
                CaptureError::InternalFailure(format!("failed to spawn reader thread: {}", e))
            })?;
        self.reader = Some(reader);

        Ok(profile)
    }

    /// Stop streaming and release the sensor.
    ///
    /// Idempotent from Idle. By the time this returns, both worker threads
    /// have been joined and every queued delegate callback has run — no
    /// `on_frame` or `on_state_change` follows. In Failed, use
    /// [`reset`](CaptureSession::reset) instead.
    pub fn stop(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Idle => return Ok(()),
            SessionState::Running | SessionState::Paused => {}
            other => {
                return Err(CaptureError::InvalidState {
                    op: "stop",
                    state: other.name(),
                })
            }
        }

        log::info!("Stopping capture session");
        self.transition(SessionState::Stopping);
        self.teardown_stream();
        self.transition(SessionState::Idle);
        self.join_dispatcher();
        Ok(())
    }

    /// Suspend frame delivery while keeping the hardware stream alive.
    /// Pending unpaired frames are discarded so a stale pair can never form
    /// across the gap.
    pub fn pause(&mut self) -> Result<()> {
        if self.state() != SessionState::Running {
            return Err(CaptureError::InvalidState {
                op: "pause",
                state: self.state().name(),
            });
        }
        self.transition(SessionState::Paused);
        log::info!("Capture session paused");
        Ok(())
    }

    /// Resume frame delivery after [`pause`](CaptureSession::pause).
    pub fn resume(&mut self) -> Result<()> {
        if self.state() != SessionState::Paused {
            return Err(CaptureError::InvalidState {
                op: "resume",
                state: self.state().name(),
            });
        }
        self.transition(SessionState::Running);
        log::info!("Capture session resumed");
        Ok(())
    }

    /// Return a Failed session to Idle, releasing whatever the failure left
    /// behind. No-op from Idle.
    pub fn reset(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Failed(_) => {}
            SessionState::Idle => return Ok(()),
            other => {
                return Err(CaptureError::InvalidState {
                    op: "reset",
                    state: other.name(),
                })
            }
        }

        log::info!("Resetting failed capture session");
        self.teardown_stream();
        self.manager.disconnect();
        self.transition(SessionState::Idle);
        self.join_dispatcher();
        self.profile = None;
        Ok(())
    }

    fn spawn_dispatcher(&mut self) -> Result<()> {
        let delegate = self.delegate.take().ok_or_else(|| {
            CaptureError::InternalFailure("delegate lost by a previous failure".into())
        })?;
        let (tx, rx) = crossbeam_channel::bounded(self.config.channel_capacity);
        let shared = self.shared.clone();
        let dispatcher = std::thread::Builder::new()
            .name("depthcap-dispatch".into())
            .spawn(move || dispatch_loop(rx, delegate, shared))
            .map_err(|e| {
                CaptureError::InternalFailure(format!("failed to spawn dispatch thread: {}", e))
            })?;
        self.events_tx = Some(tx);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Stop the reader, command the sensor to stop, release the handle.
    fn teardown_stream(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            match reader.join() {
                Ok(Some(mut link)) => {
                    if let Err(e) = link.stop_streams() {
                        log::warn!("Stream stop command failed: {}", e);
                    }
                }
                Ok(None) => {} // link died with the sensor
                Err(_) => log::warn!("Reader thread panicked"),
            }
        }
        self.manager.disconnect();
    }

    /// Close the event channel and drain every queued callback.
    fn join_dispatcher(&mut self) {
        drop(self.events_tx.take());
        if let Some(dispatcher) = self.dispatcher.take() {
            match dispatcher.join() {
                Ok(delegate) => self.delegate = Some(delegate),
                Err(_) => log::warn!("Dispatch thread panicked, delegate lost"),
            }
        }
    }

    fn transition(&mut self, new: SessionState) {
        let old = self.shared.swap(&new);
        if old == new {
            return;
        }
        log::info!("Session state: {} -> {}", old.name(), new.name());
        if let Some(tx) = &self.events_tx {
            // Control events must not be lost; the dispatcher drains quickly.
            let _ = tx.send(DelegateEvent::StateChange(old, new));
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown_stream();
        self.join_dispatcher();
    }
}

/// The reader loop runs on a dedicated thread and owns the sensor link.
///
/// Frames flow link -> synchronizer -> event channel. The frame path never
/// blocks: pairs go out with `try_send` and are dropped when the consumer
/// lags. Returns the link for an orderly stream-stop command, or None when
/// the sensor is gone.
fn reader_loop(
    mut link: Box<dyn SensorLink>,
    mut synchronizer: FrameSynchronizer,
    events_tx: Sender<DelegateEvent>,
    shared: Arc<SharedState>,
    stop_flag: Arc<AtomicBool>,
    monitor: ConnectionMonitor,
    read_timeout: Duration,
) -> Option<Box<dyn SensorLink>> {
    log::info!("Frame reader started");
    // Stream-clock estimate for expiring unpaired frames while the sensor
    // is quiet; advanced by frame timestamps and by read timeouts.
    let mut stream_clock_us = 0u64;

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Frame reader stopping (stop flag set)");
            monitor.mark_connected();
            return Some(link);
        }

        match link.read_frame(read_timeout) {
            Ok(None) => {
                stream_clock_us += read_timeout.as_micros() as u64;
                for drop in synchronizer.expire_older_than(stream_clock_us) {
                    send_dropped(&events_tx, drop.modality, drop.timestamp_us);
                }
            }
            Ok(Some(frame)) => {
                stream_clock_us = stream_clock_us.max(frame.timestamp_us);

                if shared.is_paused() {
                    synchronizer.clear();
                    continue;
                }
                if !shared.is_running() {
                    continue;
                }

                let out = synchronizer.push(frame);
                for drop in out.dropped {
                    send_dropped(&events_tx, drop.modality, drop.timestamp_us);
                }
                if let Some(pair) = out.pair {
                    match events_tx.try_send(DelegateEvent::Frame(pair)) {
                        Ok(()) => {}
                        Err(crossbeam_channel::TrySendError::Full(_)) => {
                            log::trace!("Delegate channel full, dropping frame pair");
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                            log::info!("Delegate channel closed, stopping reader");
                            return Some(link);
                        }
                    }
                }
            }
            Err(CaptureError::SensorDisconnected) => {
                log::warn!("Sensor disconnected while streaming");
                monitor.mark_lost();
                fail_from_reader(&shared, &events_tx, CaptureError::SensorDisconnected);
                return None;
            }
            Err(e) => {
                log::warn!("Frame read failed: {}", e);
                monitor.mark_lost();
                fail_from_reader(
                    &shared,
                    &events_tx,
                    CaptureError::InternalFailure(e.to_string()),
                );
                return None;
            }
        }
    }
}

/// Terminal failure on the reader path: one state change, one error event.
fn fail_from_reader(shared: &SharedState, events_tx: &Sender<DelegateEvent>, error: CaptureError) {
    let new = SessionState::Failed(format!("{}: {}", error.kind(), error));
    let old = shared.swap(&new);
    log::info!("Session state: {} -> {}", old.name(), new.name());
    let _ = events_tx.send(DelegateEvent::StateChange(old, new));
    let _ = events_tx.send(DelegateEvent::Error(error));
}

fn send_dropped(events_tx: &Sender<DelegateEvent>, modality: Modality, timestamp_us: u64) {
    match events_tx.try_send(DelegateEvent::Dropped(modality, timestamp_us)) {
        Ok(()) | Err(crossbeam_channel::TrySendError::Disconnected(_)) => {}
        Err(crossbeam_channel::TrySendError::Full(_)) => {
            log::trace!("Delegate channel full, dropping diagnostic");
        }
    }
}

/// The dispatch loop runs on a dedicated thread and owns the delegate.
///
/// Exits when every sender is gone and the queue is drained, which is what
/// lets `stop()` guarantee quiescence by joining this thread. Frames queued
/// across a pause or stop are discarded here so `on_frame` never fires
/// outside Running.
fn dispatch_loop(
    rx: Receiver<DelegateEvent>,
    mut delegate: Box<dyn CaptureDelegate>,
    shared: Arc<SharedState>,
) -> Box<dyn CaptureDelegate> {
    for event in rx.iter() {
        match event {
            DelegateEvent::Frame(pair) => {
                if shared.is_running() {
                    delegate.on_frame(pair);
                }
            }
            DelegateEvent::Dropped(modality, timestamp_us) => {
                delegate.on_frame_dropped(modality, timestamp_us);
            }
            DelegateEvent::StateChange(old, new) => delegate.on_state_change(old, new),
            DelegateEvent::Error(error) => delegate.on_error(&error),
        }
    }
    delegate
}
