//! Timestamp-based pairing of depth and color frames.

use crate::types::{Modality, RawFrame, StreamProfile, SynchronizedFramePair};

/// Synchronizer tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncConfig {
    /// Pairing tolerance in microseconds. `None` derives it from the
    /// negotiated frame rate (half the frame period).
    pub tolerance_us: Option<u64>,
}

impl SyncConfig {
    /// Effective tolerance window W for a negotiated profile.
    pub fn tolerance_for(&self, profile: &StreamProfile) -> u64 {
        self.tolerance_us
            .unwrap_or_else(|| (profile.frame_period_us() / 2).max(1))
    }
}

/// Record of a frame that left the synchronizer unpaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedFrame {
    pub modality: Modality,
    pub timestamp_us: u64,
}

/// What one `push()` produced.
#[derive(Debug, Default)]
pub struct SyncOutput {
    pub pair: Option<SynchronizedFramePair>,
    pub dropped: Vec<DroppedFrame>,
}

/// Pairs depth and color frames whose timestamps lie within a tolerance
/// window W.
///
/// At most one unmatched frame is held per modality; a newer frame of the
/// same modality replaces (and drops) the old one, which bounds memory and
/// favors freshness over completeness. Runs on the reader thread with no
/// locks — `push()` never blocks.
pub struct FrameSynchronizer {
    tolerance_us: u64,
    pending_depth: Option<RawFrame>,
    pending_color: Option<RawFrame>,
}

impl FrameSynchronizer {
    pub fn new(tolerance_us: u64) -> Self {
        Self {
            tolerance_us,
            pending_depth: None,
            pending_color: None,
        }
    }

    pub fn tolerance_us(&self) -> u64 {
        self.tolerance_us
    }

    /// Ingest one frame.
    ///
    /// If the other modality holds an unmatched frame within W, a pair is
    /// emitted and both slots clear. Otherwise the frame takes its modality's
    /// slot; whatever that displaces, and any counterpart frame that can no
    /// longer pair, comes back as dropped.
    pub fn push(&mut self, frame: RawFrame) -> SyncOutput {
        let mut out = SyncOutput::default();

        if let Some(other) = self.slot(frame.modality.other()).take() {
            if frame.timestamp_us.abs_diff(other.timestamp_us) < self.tolerance_us {
                out.pair = Some(make_pair(frame, other));
                return out;
            }
            if other.timestamp_us > frame.timestamp_us {
                // The counterpart is already ahead of this frame by at least
                // W; later counterparts will only be further ahead. The
                // incoming frame is stale on arrival.
                let other_modality = other.modality;
                *self.slot(other_modality) = Some(other);
                log::trace!(
                    "{:?} frame at {}us stale on arrival, dropping",
                    frame.modality,
                    frame.timestamp_us
                );
                out.dropped.push(DroppedFrame {
                    modality: frame.modality,
                    timestamp_us: frame.timestamp_us,
                });
                return out;
            }
            // The counterpart aged out of the window.
            log::trace!(
                "{:?} frame at {}us expired unpaired",
                other.modality,
                other.timestamp_us
            );
            out.dropped.push(DroppedFrame {
                modality: other.modality,
                timestamp_us: other.timestamp_us,
            });
        }

        if let Some(old) = self.slot(frame.modality).replace(frame) {
            // Same-modality replacement: older frames are dropped, never queued.
            log::trace!(
                "{:?} frame at {}us replaced unpaired",
                old.modality,
                old.timestamp_us
            );
            out.dropped.push(DroppedFrame {
                modality: old.modality,
                timestamp_us: old.timestamp_us,
            });
        }

        out
    }

    /// Drop pending frames that can no longer pair, judged against the
    /// current stream clock. Called by the reader when the sensor goes quiet.
    pub fn expire_older_than(&mut self, now_us: u64) -> Vec<DroppedFrame> {
        let tolerance = self.tolerance_us;
        let mut dropped = Vec::new();
        for slot in [&mut self.pending_depth, &mut self.pending_color] {
            if let Some(frame) = slot {
                if now_us.saturating_sub(frame.timestamp_us) >= tolerance {
                    dropped.push(DroppedFrame {
                        modality: frame.modality,
                        timestamp_us: frame.timestamp_us,
                    });
                    *slot = None;
                }
            }
        }
        dropped
    }

    /// Discard pending frames without drop records (pause/teardown).
    pub fn clear(&mut self) {
        self.pending_depth = None;
        self.pending_color = None;
    }

    fn slot(&mut self, modality: Modality) -> &mut Option<RawFrame> {
        match modality {
            Modality::Depth => &mut self.pending_depth,
            Modality::Color => &mut self.pending_color,
        }
    }
}

fn make_pair(a: RawFrame, b: RawFrame) -> SynchronizedFramePair {
    let (depth, color) = match a.modality {
        Modality::Depth => (a, b),
        Modality::Color => (b, a),
    };
    SynchronizedFramePair { depth, color }
}
