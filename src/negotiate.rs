//! Stream profile negotiation against the sensor's capability table.

use crate::types::{Capabilities, DepthMode, Modality, Resolution, StreamMode, StreamProfile};
use crate::{CaptureError, Result};

/// Resolve a requested profile against the sensor's capability table.
///
/// An exact (resolution, frame-rate) match is returned unchanged. Otherwise
/// the fallback is deterministic: among all combos that serve every requested
/// modality, pick the minimum of
///
///   (|fps - requested fps|, |pixels - requested pixels|, pixels, fps)
///
/// compared lexicographically — a frame-rate match always beats a resolution
/// match, and the final two keys break ties without depending on table order.
/// Fails with `UnsupportedProfile` only when no combo preserves modality
/// presence, or when the requested pixel formats exceed the sensor's
/// capability flags.
pub fn negotiate(
    requested: &StreamProfile,
    table: &[StreamMode],
    caps: Capabilities,
) -> Result<StreamProfile> {
    if requested.frame_rate == 0 {
        return Err(CaptureError::UnsupportedProfile(
            "frame rate must be nonzero".into(),
        ));
    }
    if !requested.wants_depth() && !requested.wants_color() {
        return Err(CaptureError::UnsupportedProfile(
            "profile enables no modality".into(),
        ));
    }

    if requested.wants_depth() && !caps.contains(Capabilities::DEPTH) {
        return Err(CaptureError::UnsupportedProfile(
            "sensor has no depth stream".into(),
        ));
    }
    if requested.depth_mode == DepthMode::Registered16
        && !caps.contains(Capabilities::REGISTERED_DEPTH)
    {
        return Err(CaptureError::UnsupportedProfile(
            "sensor cannot register depth to color".into(),
        ));
    }
    if requested.wants_color() && !caps.contains(Capabilities::COLOR) {
        return Err(CaptureError::UnsupportedProfile(
            "sensor has no color stream".into(),
        ));
    }

    let combos = viable_combos(requested, table);
    let exact = (requested.resolution, requested.frame_rate);
    let chosen = if combos.contains(&exact) {
        exact
    } else {
        let best = combos
            .iter()
            .copied()
            .min_by_key(|&(res, fps)| fallback_key(requested, res, fps))
            .ok_or_else(|| {
                CaptureError::UnsupportedProfile(format!(
                    "no mode serves the requested modalities at any resolution ({} table entries)",
                    table.len()
                ))
            })?;
        log::info!(
            "Requested {}@{}fps unavailable, falling back to {}@{}fps",
            requested.resolution,
            requested.frame_rate,
            best.0,
            best.1
        );
        best
    };

    Ok(StreamProfile {
        resolution: chosen.0,
        frame_rate: chosen.1,
        depth_mode: requested.depth_mode,
        color_mode: requested.color_mode,
    })
}

/// Distinct (resolution, frame-rate) combos that serve every requested modality.
fn viable_combos(requested: &StreamProfile, table: &[StreamMode]) -> Vec<(Resolution, u32)> {
    let mut combos: Vec<(Resolution, u32)> = Vec::new();
    for mode in table {
        let combo = (mode.resolution, mode.frame_rate);
        if combos.contains(&combo) {
            continue;
        }
        let serves = |modality: Modality| {
            table
                .iter()
                .any(|m| m.modality == modality && (m.resolution, m.frame_rate) == combo)
        };
        if (!requested.wants_depth() || serves(Modality::Depth))
            && (!requested.wants_color() || serves(Modality::Color))
        {
            combos.push(combo);
        }
    }
    combos
}

fn fallback_key(requested: &StreamProfile, res: Resolution, fps: u32) -> (u32, u64, u64, u32) {
    (
        fps.abs_diff(requested.frame_rate),
        res.pixels().abs_diff(requested.resolution.pixels()),
        res.pixels(),
        fps,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColorMode;

    fn depth_mode(res: Resolution, fps: u32) -> StreamMode {
        StreamMode {
            resolution: res,
            frame_rate: fps,
            modality: Modality::Depth,
        }
    }

    fn color_mode_entry(res: Resolution, fps: u32) -> StreamMode {
        StreamMode {
            resolution: res,
            frame_rate: fps,
            modality: Modality::Color,
        }
    }

    fn depth_only(res: Resolution, fps: u32) -> StreamProfile {
        StreamProfile {
            resolution: res,
            frame_rate: fps,
            depth_mode: DepthMode::Raw16,
            color_mode: ColorMode::Off,
        }
    }

    const ALL_CAPS: Capabilities = Capabilities::all();

    #[test]
    fn exact_match_is_returned_unchanged() {
        let table = [
            depth_mode(Resolution::VGA, 30),
            color_mode_entry(Resolution::VGA, 30),
        ];
        let requested = StreamProfile::default();
        let got = negotiate(&requested, &table, ALL_CAPS).unwrap();
        assert_eq!(got, requested);
    }

    #[test]
    fn frame_rate_beats_resolution_on_fallback() {
        // The documented tie-break scenario: requested 1280x1024@30 against
        // {640x480@30, 1280x1024@15} resolves to 640x480@30.
        let table = [
            depth_mode(Resolution::VGA, 30),
            depth_mode(Resolution::SXGA, 15),
        ];
        let requested = depth_only(Resolution::SXGA, 30);
        let got = negotiate(&requested, &table, ALL_CAPS).unwrap();
        assert_eq!(got.resolution, Resolution::VGA);
        assert_eq!(got.frame_rate, 30);
    }

    #[test]
    fn fallback_is_deterministic_under_table_reordering() {
        let a = [
            depth_mode(Resolution::VGA, 30),
            depth_mode(Resolution::SXGA, 15),
            depth_mode(Resolution::new(320, 240), 30),
        ];
        let mut b = a;
        b.reverse();

        let requested = depth_only(Resolution::SXGA, 30);
        let from_a = negotiate(&requested, &a, ALL_CAPS).unwrap();
        let from_b = negotiate(&requested, &b, ALL_CAPS).unwrap();
        assert_eq!(from_a, from_b);
        // 640x480 is nearer to 1280x1024 in pixel count than 320x240.
        assert_eq!(from_a.resolution, Resolution::VGA);
    }

    #[test]
    fn both_modalities_must_share_the_combo() {
        // Depth exists at VGA@30 but color only at SXGA@15, so a depth+color
        // request can only land on a combo serving both.
        let table = [
            depth_mode(Resolution::VGA, 30),
            depth_mode(Resolution::SXGA, 15),
            color_mode_entry(Resolution::SXGA, 15),
        ];
        let requested = StreamProfile {
            resolution: Resolution::VGA,
            frame_rate: 30,
            depth_mode: DepthMode::Raw16,
            color_mode: ColorMode::Rgb8,
        };
        let got = negotiate(&requested, &table, ALL_CAPS).unwrap();
        assert_eq!(got.resolution, Resolution::SXGA);
        assert_eq!(got.frame_rate, 15);
    }

    #[test]
    fn unsupported_when_no_combo_serves_modalities() {
        let table = [depth_mode(Resolution::VGA, 30)];
        let requested = StreamProfile {
            resolution: Resolution::VGA,
            frame_rate: 30,
            depth_mode: DepthMode::Raw16,
            color_mode: ColorMode::Rgb8,
        };
        let err = negotiate(&requested, &table, ALL_CAPS).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedProfile(_)));
    }

    #[test]
    fn registered_depth_requires_capability() {
        let table = [
            depth_mode(Resolution::VGA, 30),
            color_mode_entry(Resolution::VGA, 30),
        ];
        let requested = StreamProfile {
            depth_mode: DepthMode::Registered16,
            ..StreamProfile::default()
        };
        let caps = Capabilities::DEPTH | Capabilities::COLOR;
        let err = negotiate(&requested, &table, caps).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedProfile(_)));
    }

    #[test]
    fn empty_profile_and_zero_fps_are_rejected() {
        let table = [depth_mode(Resolution::VGA, 30)];
        let none = StreamProfile {
            depth_mode: DepthMode::Off,
            color_mode: ColorMode::Off,
            ..StreamProfile::default()
        };
        assert!(negotiate(&none, &table, ALL_CAPS).is_err());

        let zero = StreamProfile {
            frame_rate: 0,
            ..depth_only(Resolution::VGA, 0)
        };
        assert!(negotiate(&zero, &table, ALL_CAPS).is_err());
    }
}
