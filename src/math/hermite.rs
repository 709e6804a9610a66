//! Monotone piecewise-cubic Hermite interpolation.
//!
//! Slopes follow Fritsch–Carlson with the weighted harmonic mean used by
//! PCHIP, so each segment stays within the range of its two knots: an
//! interpolated value never overshoots the samples bounding it.

use crate::error::{ProcessingError, Result};

/// Monotone cubic through a set of knots.
#[derive(Debug, Clone)]
pub struct MonotoneCubic {
    xs: Vec<f64>,
    ys: Vec<f64>,
    slopes: Vec<f64>,
}

impl MonotoneCubic {
    /// Build an interpolant.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two knots are given, lengths differ, or
    /// `xs` is not strictly increasing.
    pub fn new(xs: &[f64], ys: &[f64]) -> Result<Self> {
        if xs.len() != ys.len() {
            return Err(ProcessingError::invalid_input(format!(
                "{} knots vs {} values",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(ProcessingError::trajectory_too_short(2, xs.len()));
        }
        if let Some(i) = xs.windows(2).position(|w| w[1] <= w[0]) {
            return Err(ProcessingError::invalid_input(format!(
                "knots must be strictly increasing at index {}",
                i + 1
            )));
        }

        let slopes = pchip_slopes(xs, ys);
        Ok(Self {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            slopes,
        })
    }

    /// Evaluate at `x`. Outside the knot range the nearest end value is
    /// returned.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }

        // Segment k with xs[k] <= x < xs[k + 1]
        let k = self.xs.partition_point(|&knot| knot <= x) - 1;
        let h = self.xs[k + 1] - self.xs[k];
        let t = (x - self.xs[k]) / h;
        let t2 = t * t;
        let t3 = t2 * t;

        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * self.ys[k]
            + h10 * h * self.slopes[k]
            + h01 * self.ys[k + 1]
            + h11 * h * self.slopes[k + 1]
    }
}

fn pchip_slopes(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = ys
        .windows(2)
        .zip(h.iter())
        .map(|(w, &hk)| (w[1] - w[0]) / hk)
        .collect();

    if n == 2 {
        return vec![delta[0], delta[0]];
    }

    let mut m = vec![0.0; n];
    for k in 1..n - 1 {
        let (d0, d1) = (delta[k - 1], delta[k]);
        if d0 * d1 <= 0.0 {
            continue;
        }
        let w1 = 2.0 * h[k] + h[k - 1];
        let w2 = h[k] + 2.0 * h[k - 1];
        m[k] = (w1 + w2) / (w1 / d0 + w2 / d1);
    }
    m[0] = edge_slope(h[0], h[1], delta[0], delta[1]);
    m[n - 1] = edge_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    m
}

/// One-sided three-point slope, clamped to preserve monotonicity.
fn edge_slope(h0: f64, h1: f64, d0: f64, d1: f64) -> f64 {
    let m = ((2.0 * h0 + h1) * d0 - h0 * d1) / (h0 + h1);
    if m.signum() != d0.signum() || d0 == 0.0 {
        0.0
    } else if d0.signum() != d1.signum() && m.abs() > 3.0 * d0.abs() {
        3.0 * d0
    } else {
        m
    }
}
