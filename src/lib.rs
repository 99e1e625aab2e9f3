//! # depthcap - Capture-session core for USB depth/color cameras
//!
//! Library driving a HID depth sensor end to end:
//! - Device discovery and acquisition with permission and timeout handling
//! - Stream profile negotiation against the sensor's capability table
//! - Timestamp-based depth/color frame synchronization
//! - A session state machine dispatching synchronized pairs to a delegate
//!
//! ## Quick Start
//! ```no_run
//! use depthcap::{CaptureDelegate, CaptureError, CaptureSession, SessionConfig};
//! use depthcap::{SensorManager, SessionState, StreamProfile, SynchronizedFramePair};
//! use std::time::Duration;
//!
//! struct Printer;
//!
//! impl CaptureDelegate for Printer {
//!     fn on_frame(&mut self, pair: SynchronizedFramePair) {
//!         println!("pair spread: {}us", pair.spread_us());
//!     }
//!     fn on_state_change(&mut self, old: SessionState, new: SessionState) {
//!         println!("{} -> {}", old.name(), new.name());
//!     }
//!     fn on_error(&mut self, error: &CaptureError) {
//!         eprintln!("error: {}", error);
//!     }
//! }
//!
//! let manager = SensorManager::hid(Duration::from_secs(2));
//! let mut session = CaptureSession::new(manager, Box::new(Printer), SessionConfig::default());
//! let profile = session.start(StreamProfile::default()).unwrap();
//! println!("streaming {}@{}fps", profile.resolution, profile.frame_rate);
//! std::thread::sleep(Duration::from_secs(5));
//! session.stop().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod hid;
pub mod sensor;
pub mod negotiate;
pub mod sync;
pub mod session;

pub use error::CaptureError;
pub use types::*;
pub use sensor::{list_sensors, SensorDriver, SensorLink, SensorManager};
pub use negotiate::negotiate;
pub use sync::{DroppedFrame, FrameSynchronizer, SyncConfig};
pub use session::{CaptureDelegate, CaptureSession, SessionConfig};

/// Result type alias for depthcap operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
