//! Linear algebra utilities for trajectory processing.
//!
//! Small fixed-size vector helpers for 3D samples, and least-squares
//! polynomial projection weights built with nalgebra's SVD.

use nalgebra::DMatrix;

use crate::error::{ProcessingError, Result};

/// Singular values below this are treated as zero in the pseudo-inverse.
const PINV_EPS: f64 = 1e-12;

/// Component-wise difference `a - b`.
#[must_use]
#[inline]
pub fn sub3(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Component-wise sum `a + b`.
#[must_use]
#[inline]
pub fn add3(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Compute the norm of a 3D vector.
#[must_use]
#[inline]
pub fn norm3(v: &[f64; 3]) -> f64 {
    norm3_squared(v).sqrt()
}

/// Squared norm of a 3D vector.
#[must_use]
#[inline]
pub fn norm3_squared(v: &[f64; 3]) -> f64 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

/// Weights that project a symmetric window onto a least-squares polynomial
/// and evaluate it at the centre sample.
///
/// For half-width `h` and order `p` the result has `2h + 1` entries; the
/// smoothed centre value is `sum(w[k] * y[k])`. These are the Savitzky–Golay
/// convolution coefficients.
///
/// # Errors
///
/// Returns an error if `order >= 2h + 1`, since the fit would be
/// underdetermined.
pub fn polynomial_projection_weights(half_width: usize, order: usize) -> Result<Vec<f64>> {
    let len = 2 * half_width + 1;
    if order >= len {
        return Err(ProcessingError::invalid_input(format!(
            "polynomial order {order} needs a window longer than {len}"
        )));
    }

    // Vandermonde design matrix over offsets -h..=h
    let design = DMatrix::from_fn(len, order + 1, |row, col| {
        let offset = row as f64 - half_width as f64;
        offset.powi(col as i32)
    });

    let pinv = design
        .svd(true, true)
        .pseudo_inverse(PINV_EPS)
        .map_err(|e| ProcessingError::invalid_input(e.to_string()))?;

    // Row 0 yields the constant coefficient, i.e. the fitted value at offset 0.
    Ok(pinv.row(0).iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_vector_helpers() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(sub3(&b, &a), [3.0, 4.0, 0.0]);
        assert_eq!(add3(&a, &b), [5.0, 8.0, 6.0]);
        assert_relative_eq!(norm3(&sub3(&b, &a)), 5.0);
        assert_relative_eq!(norm3_squared(&[3.0, 4.0, 0.0]), 25.0);
    }

    #[test]
    fn test_known_savgol_coefficients() {
        // Classic 5-point quadratic kernel: (-3, 12, 17, 12, -3) / 35
        let w = polynomial_projection_weights(2, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0];
        for (got, want) in w.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, want / 35.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        for (h, p) in [(1, 0), (3, 2), (5, 3), (7, 4)] {
            let w = polynomial_projection_weights(h, p).unwrap();
            assert_eq!(w.len(), 2 * h + 1);
            assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_order_zero_is_moving_average() {
        let w = polynomial_projection_weights(2, 0).unwrap();
        for v in w {
            assert_relative_eq!(v, 0.2, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_identity_window() {
        let w = polynomial_projection_weights(0, 0).unwrap();
        assert_eq!(w.len(), 1);
        assert_relative_eq!(w[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_underdetermined_rejected() {
        assert!(polynomial_projection_weights(1, 3).is_err());
    }
}
