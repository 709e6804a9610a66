//! Savitzky–Golay smoothing of averaged trajectories.
//!
//! Each output value is the constant coefficient of a least-squares
//! polynomial fitted to a symmetric window around it. Near the ends of a run
//! the window shrinks to the largest symmetric window that fits, and the
//! order drops to `window - 1` when needed; a one-frame window leaves the
//! value as is. Frames without a mean split a trajectory into runs that are
//! smoothed independently.

use rayon::prelude::*;
use tracing::debug;

use crate::average::{AveragedRecording, AveragedTrajectory};
use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::math::polynomial_projection_weights;

/// Savitzky–Golay filter with precomputed kernels.
#[derive(Debug, Clone)]
pub struct SavitzkyGolay {
    window_length: usize,
    poly_order: usize,
    /// `kernels[h]`: weights for the symmetric window of half width `h`.
    kernels: Vec<Vec<f64>>,
}

impl SavitzkyGolay {
    /// Build a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::InvalidConfig`] if `window_length` is even
    /// or not longer than `poly_order`.
    pub fn new(window_length: usize, poly_order: usize) -> Result<Self> {
        if window_length % 2 == 0 {
            return Err(ProcessingError::invalid_config(format!(
                "window_length must be odd, got {window_length}"
            )));
        }
        if poly_order >= window_length {
            return Err(ProcessingError::invalid_config(format!(
                "poly_order {poly_order} must be less than window_length {window_length}"
            )));
        }

        let half = window_length / 2;
        let kernels = (0..=half)
            .map(|h| polynomial_projection_weights(h, poly_order.min(2 * h)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            window_length,
            poly_order,
            kernels,
        })
    }

    /// Filter from the smoothing section of a configuration.
    ///
    /// # Errors
    ///
    /// See [`SavitzkyGolay::new`].
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.smoothing.window_length, config.smoothing.poly_order)
    }

    #[must_use]
    pub const fn window_length(&self) -> usize {
        self.window_length
    }

    #[must_use]
    pub const fn poly_order(&self) -> usize {
        self.poly_order
    }

    /// Smooth a contiguous sequence.
    #[must_use]
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        let max_half = self.kernels.len() - 1;
        (0..n)
            .map(|i| {
                let h = max_half.min(i).min(n - 1 - i);
                let kernel = &self.kernels[h];
                kernel
                    .iter()
                    .zip(&values[i - h..=i + h])
                    .map(|(w, v)| w * v)
                    .sum()
            })
            .collect()
    }

    /// Smooth 3D points per axis, treating `None` as a run break.
    #[must_use]
    pub fn apply_points(&self, points: &[Option<[f64; 3]>]) -> Vec<Option<[f64; 3]>> {
        let mut out = points.to_vec();
        let mut start = 0;
        while start < points.len() {
            if points[start].is_none() {
                start += 1;
                continue;
            }
            let end = points[start..]
                .iter()
                .position(Option::is_none)
                .map_or(points.len(), |p| start + p);
            let run: Vec<[f64; 3]> = points[start..end].iter().flatten().copied().collect();
            for axis in 0..3 {
                let axis_values: Vec<f64> = run.iter().map(|p| p[axis]).collect();
                for (k, v) in self.apply(&axis_values).into_iter().enumerate() {
                    if let Some(p) = out[start + k].as_mut() {
                        p[axis] = v;
                    }
                }
            }
            start = end;
        }
        out
    }

    /// Smooth the means of one averaged trajectory in place.
    ///
    /// Counts and spreads are left untouched.
    pub fn smooth_trajectory(&self, trajectory: &mut AveragedTrajectory) {
        let means: Vec<Option<[f64; 3]>> = trajectory.samples().iter().map(|s| s.mean).collect();
        let smoothed = self.apply_points(&means);
        for (sample, mean) in trajectory.samples_mut().iter_mut().zip(smoothed) {
            sample.mean = mean;
        }
    }
}

/// Smooth every marker of an aggregate in place.
///
/// # Errors
///
/// Returns an error if the smoothing configuration is invalid.
pub fn smooth_recording(recording: &mut AveragedRecording, config: &PipelineConfig) -> Result<()> {
    let filter = SavitzkyGolay::from_config(config)?;
    let key = recording.key().to_string();
    let mut trajectories: Vec<&mut AveragedTrajectory> = recording.trajectories_mut().collect();
    trajectories
        .par_iter_mut()
        .for_each(|t| filter.smooth_trajectory(t));
    debug!(
        group = %key,
        window = filter.window_length(),
        order = filter.poly_order(),
        "smoothed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::average::average_trials;
    use crate::recording::{MarkerId, MarkerTrajectory, Recording, RecordingKey};
    use approx::assert_relative_eq;

    fn noisy(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (i as f64 * 0.3).sin() * 10.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect()
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(SavitzkyGolay::new(4, 2).is_err());
        assert!(SavitzkyGolay::new(5, 5).is_err());
        assert!(SavitzkyGolay::new(1, 0).is_ok());
    }

    #[test]
    fn test_window_one_is_identity() {
        let filter = SavitzkyGolay::new(1, 0).unwrap();
        let values = noisy(20);
        assert_eq!(filter.apply(&values), values);
    }

    #[test]
    fn test_preserves_quadratic_including_edges() {
        let filter = SavitzkyGolay::new(11, 2).unwrap();
        let values: Vec<f64> = (0..30).map(|i| 0.5 * (i * i) as f64 - 3.0 * i as f64 + 2.0).collect();
        let smoothed = filter.apply(&values);
        assert_eq!(smoothed.len(), values.len());
        for (a, b) in smoothed.iter().zip(&values) {
            assert_relative_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_known_kernel_value() {
        // 5-point quadratic kernel: (-3, 12, 17, 12, -3) / 35
        let filter = SavitzkyGolay::new(5, 2).unwrap();
        let values = [0.0, 0.0, 35.0, 0.0, 0.0];
        let smoothed = filter.apply(&values);
        assert_relative_eq!(smoothed[2], 17.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reduces_noise_and_not_idempotent() {
        let filter = SavitzkyGolay::new(7, 2).unwrap();
        let values = noisy(40);
        let once = filter.apply(&values);
        let twice = filter.apply(&once);
        assert_eq!(once.len(), 40);

        let roughness = |v: &[f64]| v.windows(3).map(|w| (w[0] - 2.0 * w[1] + w[2]).abs()).sum::<f64>();
        assert!(roughness(&once) < roughness(&values));
        assert!(once.iter().zip(&twice).any(|(a, b)| (a - b).abs() > 1e-9));
    }

    #[test]
    fn test_missing_frames_split_runs() {
        let filter = SavitzkyGolay::new(5, 1).unwrap();
        let mut points: Vec<Option<[f64; 3]>> = (0..12).map(|i| Some([i as f64; 3])).collect();
        points[5] = None;
        let out = filter.apply_points(&points);
        assert_eq!(out.len(), 12);
        assert!(out[5].is_none());
        // Linear data survives order-1 smoothing on both sides of the hole
        for (i, p) in out.iter().enumerate().filter(|(i, _)| *i != 5) {
            assert_relative_eq!(p.unwrap()[1], i as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_smooth_recording_preserves_shape() {
        let points: Vec<[f64; 3]> = noisy(25).into_iter().map(|v| [v, -v, 0.0]).collect();
        let rec = Recording::new(
            RecordingKey::new("1", "kreis", "1"),
            200.0,
            [
                MarkerTrajectory::from_points(MarkerId(1), &points),
                MarkerTrajectory::from_points(MarkerId(2), &points),
            ],
        )
        .unwrap();
        let config = PipelineConfig::default();
        let mut avg = average_trials(&[&rec], &config).unwrap();
        let before = avg.clone();
        smooth_recording(&mut avg, &config).unwrap();

        assert_eq!(avg.frame_count(), before.frame_count());
        assert_eq!(avg.marker_ids().collect::<Vec<_>>(), before.marker_ids().collect::<Vec<_>>());
        let t = avg.marker(MarkerId(1)).unwrap();
        assert_eq!(t.len(), 25);
        assert!(t.samples().iter().all(|s| s.count == 1));
        assert_ne!(t, before.marker(MarkerId(1)).unwrap());
    }
}
