/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Resolution = Resolution::new(640, 480);
    pub const SXGA: Resolution = Resolution::new(1280, 1024);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, the distance metric for resolution fallback.
    pub const fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which stream a raw frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Depth,
    Color,
}

impl Modality {
    pub fn other(self) -> Modality {
        match self {
            Modality::Depth => Modality::Color,
            Modality::Color => Modality::Depth,
        }
    }
}

/// Depth stream pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthMode {
    /// Depth stream disabled.
    Off,
    /// Raw 16-bit depth in millimeters.
    Raw16,
    /// 16-bit depth registered to the color camera viewpoint.
    /// Requires the REGISTERED_DEPTH capability.
    Registered16,
}

/// Color stream pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    /// Color stream disabled.
    Off,
    /// Packed 8-bit RGB.
    Rgb8,
    /// YUV 4:2:2 as delivered by the sensor ISP.
    Yuv422,
}

/// A requested or negotiated streaming configuration.
///
/// Immutable once a session starts; the session controller validates it via
/// [`crate::negotiate::negotiate`] before touching the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub resolution: Resolution,
    /// Frames per second for both streams.
    pub frame_rate: u32,
    pub depth_mode: DepthMode,
    pub color_mode: ColorMode,
}

impl StreamProfile {
    /// Frame period in microseconds. Zero frame rate is rejected during
    /// negotiation, but guard anyway so this can never divide by zero.
    pub fn frame_period_us(&self) -> u64 {
        1_000_000 / self.frame_rate.max(1) as u64
    }

    pub fn wants_depth(&self) -> bool {
        self.depth_mode != DepthMode::Off
    }

    pub fn wants_color(&self) -> bool {
        self.color_mode != ColorMode::Off
    }
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            resolution: Resolution::VGA,
            frame_rate: 30,
            depth_mode: DepthMode::Raw16,
            color_mode: ColorMode::Rgb8,
        }
    }
}

/// One modality's sample as read off the interrupt endpoint.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub modality: Modality,
    /// Sensor capture timestamp in microseconds since stream start.
    pub timestamp_us: u64,
    /// Pixel payload, reassembled from chunk reports.
    pub data: Vec<u8>,
}

/// A depth frame and a color frame whose timestamps lie within the
/// synchronizer's tolerance window. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct SynchronizedFramePair {
    pub depth: RawFrame,
    pub color: RawFrame,
}

impl SynchronizedFramePair {
    /// Absolute timestamp spread between the two frames, in microseconds.
    pub fn spread_us(&self) -> u64 {
        self.depth.timestamp_us.abs_diff(self.color.timestamp_us)
    }
}

/// Connection state of the physical sensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

/// Lifecycle state of a capture session.
///
/// Transitions are monotonic through
/// Idle -> Starting -> Running -> {Paused <-> Running} -> Stopping -> Idle,
/// except that Starting/Running may fall to Failed, which only an explicit
/// reset (or a fresh start) leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Failed(String),
}

impl SessionState {
    /// Short name for log lines and InvalidState errors.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Starting => "Starting",
            SessionState::Running => "Running",
            SessionState::Paused => "Paused",
            SessionState::Stopping => "Stopping",
            SessionState::Failed(_) => "Failed",
        }
    }
}

/// Sensor identification and capabilities, as read during discovery.
#[derive(Debug, Clone)]
pub struct SensorInfo {
    pub serial: String,
    pub firmware: String,
    pub capabilities: Capabilities,
    /// Platform HID path, used to re-open the same unit.
    pub bus_id: String,
}

/// One supported streaming mode from the sensor's capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMode {
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub modality: Modality,
}

bitflags::bitflags! {
    /// Capability bitmap reported by the sensor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const DEPTH            = 1 << 0;
        const COLOR            = 1 << 1;
        const REGISTERED_DEPTH = 1 << 2;
        const INFRARED         = 1 << 3;
    }
}
