use crate::hid::HidTransport;
use crate::protocol::{self, PID, VID};
use crate::types::{Capabilities, ConnectionState, RawFrame, SensorInfo, StreamMode, StreamProfile};
use crate::{CaptureError, Result};
use crossbeam_channel::{Receiver, Sender};
use hidapi::HidApi;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Check if a hidapi DeviceInfo matches the sensor's HID interface.
/// Interface 0 on Windows/Linux, -1 on macOS IOKit (only HID interface on the device).
fn is_depth_sensor(d: &hidapi::DeviceInfo) -> bool {
    d.vendor_id() == VID
        && d.product_id() == PID
        && (d.interface_number() == 0 || d.interface_number() == -1)
}

fn create_hid_api() -> Result<HidApi> {
    let api = HidApi::new()?;
    #[cfg(target_os = "macos")]
    {
        // Keep HID opens shared on macOS to avoid seizing the interface.
        api.set_open_exclusive(false);
    }
    Ok(api)
}

/// Map a hidapi open failure onto the capture error taxonomy.
/// hidapi reports permission problems only through the message text.
fn classify_open_error(e: hidapi::HidError) -> CaptureError {
    let msg = e.to_string().to_ascii_lowercase();
    if msg.contains("permission") || msg.contains("access") || msg.contains("not permitted") {
        CaptureError::PermissionDenied(e.to_string())
    } else {
        CaptureError::Hid(e)
    }
}

/// List all connected depth sensors with their info.
///
/// Opens each sensor temporarily to read serial, firmware, and capabilities,
/// then closes it.
pub fn list_sensors() -> Result<Vec<SensorInfo>> {
    let api = create_hid_api()?;
    let mut sensors = Vec::new();

    for dev_info in api.device_list() {
        if !is_depth_sensor(dev_info) {
            continue;
        }

        match query_sensor_info(&api, dev_info) {
            Ok(info) => sensors.push(info),
            Err(e) => {
                log::warn!("Failed to query sensor at {:?}: {}", dev_info.path(), e);
            }
        }
    }

    Ok(sensors)
}

/// Query sensor info by opening it temporarily.
fn query_sensor_info(api: &HidApi, hid_info: &hidapi::DeviceInfo) -> Result<SensorInfo> {
    let device = api.open_path(hid_info.path()).map_err(classify_open_error)?;
    let hid = HidTransport::new(device);
    let serial = hid.read_serial()?;
    let firmware = hid.read_firmware()?;
    let capabilities = hid.read_capabilities()?;

    Ok(SensorInfo {
        serial,
        firmware,
        capabilities,
        bus_id: hid_info.path().to_str().unwrap_or("").to_string(),
    })
}

/// An acquired sensor, ready for stream control and frame reads.
///
/// The handle is released when the link is dropped. [`SensorManager`] tracks
/// the connection state; exactly one link exists per manager at a time.
pub trait SensorLink: Send {
    fn info(&self) -> &SensorInfo;

    /// Supported resolution / frame-rate modes, read during acquisition.
    fn capability_table(&self) -> &[StreamMode];

    fn capabilities(&self) -> Capabilities;

    /// Command the sensor to start streaming the given (negotiated) profile.
    fn start_streams(&mut self, profile: &StreamProfile) -> Result<()>;

    /// Command the sensor to stop streaming. Idempotent.
    fn stop_streams(&mut self) -> Result<()>;

    /// Read the next complete frame, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a complete frame,
    /// and `Err(SensorDisconnected)` when the sensor drops off the bus.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>>;
}

/// Acquisition seam: produces a [`SensorLink`] or explains why it can't.
///
/// [`HidDriver`] is the production implementation; tests substitute scripted
/// drivers to exercise the session without hardware.
pub trait SensorDriver: Send {
    /// One acquisition attempt. The manager retries until its timeout.
    fn acquire(&mut self) -> Result<Box<dyn SensorLink>>;
}

/// Production sensor link over hidapi.
pub struct HidSensor {
    /// HidApi keeps the IOKit run loop alive on macOS.
    _api: HidApi,
    hid: HidTransport,
    info: SensorInfo,
    table: Vec<StreamMode>,
    assembler: protocol::FrameAssembler,
}

impl SensorLink for HidSensor {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn capability_table(&self) -> &[StreamMode] {
        &self.table
    }

    fn capabilities(&self) -> Capabilities {
        self.info.capabilities
    }

    fn start_streams(&mut self, profile: &StreamProfile) -> Result<()> {
        self.hid.start_streams(profile)
    }

    fn stop_streams(&mut self) -> Result<()> {
        self.hid.stop_streams()
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; protocol::FRAME_REPORT_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
            match self.hid.read_frame_report(&mut buf, timeout_ms.max(1))? {
                None => return Ok(None),
                Some(len) => {
                    if let Some(frame) = self.assembler.feed(&buf[..len]) {
                        return Ok(Some(frame));
                    }
                    // Partial frame: keep reading until the deadline.
                }
            }
        }
    }
}

/// Production driver: opens the first attached depth sensor.
pub struct HidDriver;

impl SensorDriver for HidDriver {
    fn acquire(&mut self) -> Result<Box<dyn SensorLink>> {
        let api = create_hid_api()?;

        let hid_info = api
            .device_list()
            .find(|d| is_depth_sensor(d))
            .ok_or(CaptureError::SensorUnavailable)?;

        let path = hid_info.path().to_owned();
        let bus_id = hid_info.path().to_str().unwrap_or("").to_string();
        let device = api.open_path(&path).map_err(classify_open_error)?;
        let hid = HidTransport::new(device);

        let serial = hid.read_serial()?;
        let firmware = hid.read_firmware()?;
        let capabilities = hid.read_capabilities()?;
        let table = hid.read_capability_table()?;

        log::info!(
            "Acquired depth sensor: serial={} firmware={} capabilities={:?} modes={}",
            serial,
            firmware,
            capabilities,
            table.len()
        );

        Ok(Box::new(HidSensor {
            _api: api,
            hid,
            info: SensorInfo {
                serial,
                firmware,
                capabilities,
                bus_id,
            },
            table,
            assembler: protocol::FrameAssembler::new(),
        }))
    }
}

/// A connection-state transition, delivered to the manager's subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

const CONN_DISCONNECTED: u8 = 0;
const CONN_CONNECTING: u8 = 1;
const CONN_CONNECTED: u8 = 2;
const CONN_STREAMING: u8 = 3;
const CONN_ERROR: u8 = 4;

fn conn_to_u8(s: ConnectionState) -> u8 {
    match s {
        ConnectionState::Disconnected => CONN_DISCONNECTED,
        ConnectionState::Connecting => CONN_CONNECTING,
        ConnectionState::Connected => CONN_CONNECTED,
        ConnectionState::Streaming => CONN_STREAMING,
        ConnectionState::Error => CONN_ERROR,
    }
}

fn conn_from_u8(v: u8) -> ConnectionState {
    match v {
        CONN_CONNECTING => ConnectionState::Connecting,
        CONN_CONNECTED => ConnectionState::Connected,
        CONN_STREAMING => ConnectionState::Streaming,
        CONN_ERROR => ConnectionState::Error,
        _ => ConnectionState::Disconnected,
    }
}

/// Owns sensor acquisition and tracks connection state.
///
/// `connect()` retries the driver within the acquisition timeout and hands
/// out the [`SensorLink`]; `disconnect()` is idempotent. State transitions
/// are published on a bounded channel; a transition to Disconnected while
/// Streaming signals an asynchronous interrupt, not a fatal error.
pub struct SensorManager {
    driver: Box<dyn SensorDriver>,
    state: Arc<AtomicU8>,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    acquire_timeout: Duration,
}

/// How long to wait between acquisition attempts within the timeout window.
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(100);

impl SensorManager {
    pub fn new(driver: Box<dyn SensorDriver>, acquire_timeout: Duration) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(64);
        Self {
            driver,
            state: Arc::new(AtomicU8::new(CONN_DISCONNECTED)),
            events_tx,
            events_rx,
            acquire_timeout,
        }
    }

    /// Production manager over the first attached sensor.
    pub fn hid(acquire_timeout: Duration) -> Self {
        Self::new(Box::new(HidDriver), acquire_timeout)
    }

    /// Lock-free snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        conn_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Receiver for connection-state transitions. Single consumer.
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    /// Attempt to acquire the sensor.
    ///
    /// Retries `SensorUnavailable` until the acquisition timeout, then fails
    /// with it. `PermissionDenied` fails immediately — waiting won't grant it.
    pub fn connect(&mut self) -> Result<Box<dyn SensorLink>> {
        self.set_state(ConnectionState::Connecting);
        let deadline = Instant::now() + self.acquire_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.driver.acquire() {
                Ok(link) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(link);
                }
                Err(CaptureError::SensorUnavailable) => {
                    if Instant::now() >= deadline {
                        log::warn!(
                            "Sensor acquisition timed out after {} attempt(s)",
                            attempt
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(CaptureError::SensorUnavailable);
                    }
                    if attempt <= 5 || attempt % 10 == 0 {
                        log::info!("Sensor not found (attempt {}), waiting...", attempt);
                    }
                    std::thread::sleep(
                        ACQUIRE_RETRY_DELAY
                            .min(deadline.saturating_duration_since(Instant::now())),
                    );
                }
                Err(e @ CaptureError::PermissionDenied(_)) => {
                    log::warn!("Sensor acquisition denied: {}", e);
                    self.set_state(ConnectionState::Error);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Sensor acquisition failed: {}", e);
                    self.set_state(ConnectionState::Error);
                    return Err(e);
                }
            }
        }
    }

    /// Record release of the sensor handle. Idempotent; the handle itself is
    /// released when the [`SensorLink`] is dropped by its owner.
    pub fn disconnect(&mut self) {
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Handle for the reader thread to report streaming status and
    /// asynchronous loss without holding the manager.
    pub(crate) fn monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor {
            state: self.state.clone(),
            events_tx: self.events_tx.clone(),
        }
    }

    fn set_state(&self, new: ConnectionState) {
        let old = conn_from_u8(self.state.swap(conn_to_u8(new), Ordering::AcqRel));
        if old != new {
            log::info!("Sensor connection: {:?} -> {:?}", old, new);
            publish(&self.events_tx, ConnectionEvent { old, new });
        }
    }
}

/// Shared-state handle used from the reader thread.
pub(crate) struct ConnectionMonitor {
    state: Arc<AtomicU8>,
    events_tx: Sender<ConnectionEvent>,
}

impl ConnectionMonitor {
    pub(crate) fn mark_streaming(&self) {
        self.transition(ConnectionState::Streaming);
    }

    pub(crate) fn mark_connected(&self) {
        self.transition(ConnectionState::Connected);
    }

    /// Asynchronous loss while streaming. The session treats this as an
    /// interrupt requiring teardown, not a crash.
    pub(crate) fn mark_lost(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, new: ConnectionState) {
        let old = conn_from_u8(self.state.swap(conn_to_u8(new), Ordering::AcqRel));
        if old != new {
            log::info!("Sensor connection: {:?} -> {:?}", old, new);
            publish(&self.events_tx, ConnectionEvent { old, new });
        }
    }
}

/// Never block a state transition on a slow subscriber.
fn publish(tx: &Sender<ConnectionEvent>, event: ConnectionEvent) {
    if let Err(crossbeam_channel::TrySendError::Full(_)) = tx.try_send(event) {
        log::trace!("Connection event channel full, dropping {:?}", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverDriver;

    impl SensorDriver for NeverDriver {
        fn acquire(&mut self) -> Result<Box<dyn SensorLink>> {
            Err(CaptureError::SensorUnavailable)
        }
    }

    struct DeniedDriver;

    impl SensorDriver for DeniedDriver {
        fn acquire(&mut self) -> Result<Box<dyn SensorLink>> {
            Err(CaptureError::PermissionDenied("no capture entitlement".into()))
        }
    }

    #[test]
    fn connect_times_out_with_sensor_unavailable() {
        let mut mgr = SensorManager::new(Box::new(NeverDriver), Duration::from_millis(50));
        let start = Instant::now();
        let err = mgr.connect().err().unwrap();
        assert!(matches!(err, CaptureError::SensorUnavailable));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn permission_denied_fails_without_retrying() {
        let mut mgr = SensorManager::new(Box::new(DeniedDriver), Duration::from_secs(10));
        let start = Instant::now();
        let err = mgr.connect().err().unwrap();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        // No retry loop: well under the 10s acquisition window.
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(mgr.state(), ConnectionState::Error);
    }

    #[test]
    fn disconnect_is_idempotent_and_publishes_once() {
        let mut mgr = SensorManager::new(Box::new(NeverDriver), Duration::from_millis(1));
        let events = mgr.subscribe();
        let _ = mgr.connect(); // Disconnected -> Connecting -> Disconnected
        mgr.disconnect();
        mgr.disconnect();

        let seen: Vec<ConnectionEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ConnectionEvent {
                    old: ConnectionState::Disconnected,
                    new: ConnectionState::Connecting,
                },
                ConnectionEvent {
                    old: ConnectionState::Connecting,
                    new: ConnectionState::Disconnected,
                },
            ]
        );
    }
}
