//! Mathematical utilities for trajectory processing.
//!
//! This module provides:
//! - [`hermite`]: monotone cubic interpolation for internal gaps
//! - [`linalg`]: 3D vector helpers and least-squares projection weights

pub mod hermite;
pub mod linalg;

pub use hermite::MonotoneCubic;
pub use linalg::{norm3, polynomial_projection_weights};
