//! Stream synchronized depth/color pairs to stdout.
//!
//! Usage: cargo run --example stream
//! Runs for 30 seconds or until the sensor disappears.

use depthcap::{
    CaptureDelegate, CaptureError, CaptureSession, Modality, SensorManager, SessionConfig,
    SessionState, StreamProfile, SynchronizedFramePair,
};
use std::time::{Duration, Instant};

struct Stats {
    start: Instant,
    pairs: u64,
    dropped: u64,
    last_report: Instant,
}

impl CaptureDelegate for Stats {
    fn on_frame(&mut self, pair: SynchronizedFramePair) {
        self.pairs += 1;

        // Print every ~30th pair to avoid flooding the terminal
        if self.pairs % 30 == 1 {
            println!(
                "depth ts={:<12} color ts={:<12} spread={}us  depth bytes={} color bytes={}",
                pair.depth.timestamp_us,
                pair.color.timestamp_us,
                pair.spread_us(),
                pair.depth.data.len(),
                pair.color.data.len(),
            );
        }

        // Report rate every 3 seconds
        let now = Instant::now();
        if now.duration_since(self.last_report) >= Duration::from_secs(3) {
            let elapsed = self.start.elapsed().as_secs_f64();
            println!(
                "--- {} pairs in {:.1}s ({:.1} Hz), {} dropped ---",
                self.pairs,
                elapsed,
                self.pairs as f64 / elapsed,
                self.dropped
            );
            self.last_report = now;
        }
    }

    fn on_state_change(&mut self, old: SessionState, new: SessionState) {
        println!("session: {} -> {}", old.name(), new.name());
    }

    fn on_error(&mut self, error: &CaptureError) {
        eprintln!("session error: {}", error);
    }

    fn on_frame_dropped(&mut self, _modality: Modality, _timestamp_us: u64) {
        self.dropped += 1;
    }
}

fn main() {
    env_logger::init();

    let manager = SensorManager::hid(Duration::from_secs(2));
    let delegate = Stats {
        start: Instant::now(),
        pairs: 0,
        dropped: 0,
        last_report: Instant::now(),
    };
    let mut session = CaptureSession::new(manager, Box::new(delegate), SessionConfig::default());

    let profile = match session.start(StreamProfile::default()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to start capture: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "Streaming {}@{}fps (depth={:?}, color={:?})...",
        profile.resolution, profile.frame_rate, profile.depth_mode, profile.color_mode
    );

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if matches!(session.state(), SessionState::Failed(_)) {
            eprintln!("Session failed, exiting");
            let _ = session.reset();
            std::process::exit(1);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    if let Err(e) = session.stop() {
        eprintln!("Failed to stop cleanly: {}", e);
    }
}
