//! Error types for trajectory processing.
//!
//! Recoverable, recording-scoped conditions (large gaps, unfilled boundaries,
//! missing motion, frames without contributors) are not errors: they travel as
//! provenance flags and notes on the data itself. [`ProcessingError`] covers
//! the failures that stop a single file, a single group, or the whole run.

use std::path::PathBuf;

use thiserror::Error;

use crate::recording::MarkerId;

/// Main error type for trajectory processing.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Filesystem failure while reading or writing a recording.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The CSV layer rejected the file.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Header row does not describe a recording.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// A field or path component could not be parsed.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Trajectories inside one recording disagree on frame count.
    #[error("Inconsistent recording: marker {marker} has {actual} frames, expected {expected}")]
    InconsistentRecording {
        marker: MarkerId,
        expected: usize,
        actual: usize,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An averaging group had no members.
    #[error("Empty averaging group: {0}")]
    EmptyGroup(String),

    /// Members of one averaging group were sampled at different rates.
    #[error("Sample rate mismatch in {group}: {expected} Hz vs {actual} Hz")]
    SampleRateMismatch {
        group: String,
        expected: f64,
        actual: f64,
    },

    /// No candidate recording has a valid sample for an anchor marker.
    #[error("No reference available for marker {marker} in experiment {experiment}")]
    NoReferenceAvailable { experiment: String, marker: MarkerId },

    /// None of an experiment's anchor markers could be resolved.
    #[error("Reference data for experiment {0} cannot be resolved")]
    ReferenceUnresolved(String),

    /// Input validation errors.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sequence too short for the requested operation.
    #[error("Trajectory too short: need at least {min} frames, got {actual}")]
    TrajectoryTooShort { min: usize, actual: usize },
}

/// Result type alias for processing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

impl ProcessingError {
    /// Create an I/O error tagged with the offending path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a malformed header error.
    #[must_use]
    pub fn malformed_header(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    /// Create a parse error.
    #[must_use]
    pub fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: msg.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an empty group error.
    #[must_use]
    pub fn empty_group(group: impl Into<String>) -> Self {
        Self::EmptyGroup(group.into())
    }

    /// Create a missing reference error.
    #[must_use]
    pub fn no_reference(experiment: impl Into<String>, marker: MarkerId) -> Self {
        Self::NoReferenceAvailable {
            experiment: experiment.into(),
            marker,
        }
    }

    /// Create a trajectory too short error.
    #[must_use]
    pub const fn trajectory_too_short(min: usize, actual: usize) -> Self {
        Self::TrajectoryTooShort { min, actual }
    }

    /// Whether this error should abort the whole run rather than one input.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::ReferenceUnresolved(_))
    }
}
