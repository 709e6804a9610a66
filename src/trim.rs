//! Idle-motion trimming.
//!
//! Per-frame displacement is aggregated across markers and smoothed by a
//! trailing rolling mean of `window_frames` frames. The last frame whose
//! rolling mean exceeds `velocity_threshold` ends the active part of the
//! recording; everything after it is cut from every marker at once.
//!
//! A window that contains a frame without any marker valid on both sides of
//! the step is undefined and never counts as motion.

use tracing::{debug, info};

use crate::config::{PipelineConfig, VelocityAggregation};
use crate::math::linalg::{norm3, norm3_squared, sub3};
use crate::recording::{Recording, RecordingNote};

/// What the trimmer did to one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimReport {
    /// Frames before trimming.
    pub original_frames: usize,
    /// Frames kept.
    pub kept_frames: usize,
    /// Last frame whose rolling window exceeded the threshold.
    pub last_active: Option<usize>,
}

impl TrimReport {
    /// Frames removed from the end.
    #[must_use]
    pub const fn removed_frames(&self) -> usize {
        self.original_frames - self.kept_frames
    }
}

/// A trimmed recording and its report.
#[derive(Debug, Clone)]
pub struct TrimmedRecording {
    pub recording: Recording,
    pub report: TrimReport,
}

/// Displacement between consecutive frames, aggregated across markers.
///
/// Frame 0 is 0. A frame where no marker is usable in both it and its
/// predecessor is `None`.
#[must_use]
pub fn frame_displacements(recording: &Recording, aggregation: VelocityAggregation) -> Vec<Option<f64>> {
    let n = recording.frame_count();
    let mut out = Vec::with_capacity(n);
    if n == 0 {
        return out;
    }
    out.push(Some(0.0));

    for frame in 1..n {
        let mut sum = 0.0;
        let mut count = 0usize;
        for trajectory in recording.trajectories() {
            let (Some(prev), Some(cur)) =
                (trajectory.position(frame - 1), trajectory.position(frame))
            else {
                continue;
            };
            let step = sub3(&cur, &prev);
            sum += match aggregation {
                VelocityAggregation::Mean => norm3(&step),
                VelocityAggregation::Norm => norm3_squared(&step),
            };
            count += 1;
        }
        out.push((count > 0).then(|| match aggregation {
            VelocityAggregation::Mean => sum / count as f64,
            VelocityAggregation::Norm => sum.sqrt(),
        }));
    }
    out
}

/// Trailing rolling mean: entry `i` averages `values[i + 1 - window..=i]`.
///
/// Entries before a full window, or whose window holds a `None`, are `None`.
#[must_use]
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            let sum: Option<f64> = slice.iter().copied().sum();
            sum.map(|s| s / window as f64)
        })
        .collect()
}

/// Last frame whose rolling displacement exceeds the threshold.
#[must_use]
pub fn last_active_frame(recording: &Recording, config: &PipelineConfig) -> Option<usize> {
    let displacement = frame_displacements(recording, config.trim.aggregation);
    let rolling = rolling_mean(&displacement, config.trim.window_frames);
    rolling
        .iter()
        .rposition(|v| v.is_some_and(|m| m > config.trim.velocity_threshold))
}

/// Cut trailing idle frames.
///
/// Keeps frames `0..=last_active`. If no window ever exceeds the threshold the
/// recording is returned at full length with [`RecordingNote::NoMotionDetected`].
#[must_use]
pub fn trim_recording(recording: &Recording, config: &PipelineConfig) -> TrimmedRecording {
    let original_frames = recording.frame_count();
    let last_active = last_active_frame(recording, config);

    let trimmed = match last_active {
        Some(last) => {
            debug!(
                recording = %recording.key(),
                cut = last + 1,
                of = original_frames,
                "truncated after last movement"
            );
            recording.truncated(last + 1)
        }
        None => {
            info!(recording = %recording.key(), "no motion detected, kept full recording");
            let mut kept = recording.clone();
            kept.add_note(RecordingNote::NoMotionDetected);
            kept
        }
    };

    TrimmedRecording {
        report: TrimReport {
            original_frames,
            kept_frames: trimmed.frame_count(),
            last_active,
        },
        recording: trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{MarkerId, MarkerTrajectory, RecordingKey};

    /// Moves `speed` units per frame along x for `moving` frames, then rests.
    fn move_then_rest(moving: usize, resting: usize, speed: f64) -> Recording {
        let mut points = Vec::new();
        let mut x = 0.0;
        for i in 0..moving + resting {
            if i > 0 && i < moving {
                x += speed;
            }
            points.push([x, 0.0, 0.0]);
        }
        let still = vec![[5.0, 5.0, 5.0]; points.len()];
        Recording::new(
            RecordingKey::new("1", "ptp", "1"),
            200.0,
            [
                MarkerTrajectory::from_points(MarkerId(1), &points),
                MarkerTrajectory::from_points(MarkerId(2), &still),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rolling_mean() {
        let v = [Some(1.0), Some(2.0), Some(3.0), None, Some(5.0), Some(6.0)];
        let r = rolling_mean(&v, 2);
        assert_eq!(r, vec![None, Some(1.5), Some(2.5), None, None, Some(5.5)]);
        assert_eq!(rolling_mean(&v, 0), vec![None; 6]);
    }

    #[test]
    fn test_displacement_aggregation() {
        let rec = move_then_rest(3, 0, 4.0);
        let mean = frame_displacements(&rec, VelocityAggregation::Mean);
        // One marker moves 4, the other 0
        assert_eq!(mean, vec![Some(0.0), Some(2.0), Some(2.0)]);
        let norm = frame_displacements(&rec, VelocityAggregation::Norm);
        assert_eq!(norm, vec![Some(0.0), Some(4.0), Some(4.0)]);
    }

    #[test]
    fn test_trailing_rest_is_cut() {
        let config = PipelineConfig::default()
            .with_trim(1.0, 5)
            .with_anchor_markers([]);
        let rec = move_then_rest(40, 60, 10.0);
        let out = trim_recording(&rec, &config);

        let last = out.report.last_active.unwrap();
        assert_eq!(out.recording.frame_count(), last + 1);
        assert!(out.recording.frame_count() < rec.frame_count());
        // Movement lasts through frame 39; the rolling mean stays above
        // threshold until the window is mostly still.
        assert!(last >= 39);
        assert!(last < 45);
        assert!(out.recording.trajectories().all(|t| t.len() == last + 1));
        assert!(out.recording.notes().is_empty());
    }

    #[test]
    fn test_still_recording_unchanged() {
        let config = PipelineConfig::default().with_trim(1.0, 5);
        let rec = move_then_rest(0, 50, 0.0);
        let out = trim_recording(&rec, &config);
        assert_eq!(out.report.last_active, None);
        assert_eq!(out.recording.frame_count(), 50);
        assert_eq!(out.recording.notes(), &[RecordingNote::NoMotionDetected]);
        assert_eq!(out.report.removed_frames(), 0);
    }

    #[test]
    fn test_shorter_than_window_is_kept() {
        let config = PipelineConfig::default().with_trim(0.5, 60);
        let rec = move_then_rest(20, 0, 10.0);
        let out = trim_recording(&rec, &config);
        assert_eq!(out.recording.frame_count(), 20);
        assert_eq!(out.recording.notes(), &[RecordingNote::NoMotionDetected]);
    }

    #[test]
    fn test_single_spike_rejected() {
        // One noisy frame does not sustain a 10-frame window above threshold.
        let mut points = vec![[0.0; 3]; 50];
        points[30] = [20.0, 0.0, 0.0];
        let rec = Recording::new(
            RecordingKey::new("1", "ptp", "1"),
            200.0,
            [MarkerTrajectory::from_points(MarkerId(1), &points)],
        )
        .unwrap();
        let config = PipelineConfig::default().with_trim(5.0, 10);
        let out = trim_recording(&rec, &config);
        assert_eq!(out.recording.frame_count(), 50);
    }

    #[test]
    fn test_never_lengthens() {
        let config = PipelineConfig::default().with_trim(1.0, 3);
        for (moving, resting) in [(10, 0), (10, 10), (1, 30), (30, 1)] {
            let rec = move_then_rest(moving, resting, 3.0);
            let out = trim_recording(&rec, &config);
            assert!(out.recording.frame_count() <= rec.frame_count());
        }
    }
}
