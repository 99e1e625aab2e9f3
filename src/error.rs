/// Errors that can occur when acquiring or streaming from a depth sensor.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("no depth sensor found (VID=1D27 PID=0600) or acquisition timed out")]
    SensorUnavailable,

    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("no supported profile satisfies the request: {0}")]
    UnsupportedProfile(String),

    #[error("{op} is not valid in the {state} state")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    #[error("sensor disconnected while streaming")]
    SensorDisconnected,

    #[error("internal sensor failure: {0}")]
    InternalFailure(String),

    #[error("invalid response: expected prefix 0x01, got 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("command echo mismatch")]
    CommandMismatch,
}

impl CaptureError {
    /// Stable variant name, used in diagnostics and failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Hid(_) => "Hid",
            CaptureError::SensorUnavailable => "SensorUnavailable",
            CaptureError::PermissionDenied(_) => "PermissionDenied",
            CaptureError::UnsupportedProfile(_) => "UnsupportedProfile",
            CaptureError::InvalidState { .. } => "InvalidState",
            CaptureError::SensorDisconnected => "SensorDisconnected",
            CaptureError::InternalFailure(_) => "InternalFailure",
            CaptureError::InvalidResponse(_) => "InvalidResponse",
            CaptureError::CommandMismatch => "CommandMismatch",
        }
    }
}
