//! Motion-capture trial reduction
//!
//! Turns raw marker recordings into clean per-experiment mean trajectories.
//!
//! Optical capture loses markers: occlusions punch holes into trajectories,
//! recordings start late or end early, and subjects rest for a while after
//! the movement is done. This library reconstructs what can be reconstructed,
//! marks what cannot, and reduces many trials to one smoothed mean.
//!
//! # Stages
//!
//! | Stage | Module | Output |
//! |-------|--------|--------|
//! | Auxiliary substitution | [`substitute`] | base markers only |
//! | Reference selection | [`reference`] | best recording per anchor marker |
//! | Gap interpolation | [`interpolate`] | filled trajectories + gap report |
//! | Idle trimming | [`trim`] | truncated recordings |
//! | Averaging | [`average`] | participant and experiment means |
//! | Smoothing | [`smooth`] | Savitzky–Golay filtered means |
//!
//! [`Pipeline`] chains them, and [`io`] reads and writes the
//! `Frame;1_X;1_Y;1_Z;...` files.
//!
//! Every synthesised sample keeps a [`Provenance`] tag, so downstream code
//! can tell measured from interpolated or reference-derived data.
//!
//! # Quick Start
//!
//! ```
//! use mocap_reduce::{MarkerId, MarkerTrajectory, Pipeline, PipelineConfig, Recording, RecordingKey};
//!
//! // Marker 1 moves along x for 80 frames and loses frames 20..25.
//! let positions: Vec<Option<[f64; 3]>> = (0..80)
//!     .map(|i| (!(20..25).contains(&i)).then(|| [i as f64 * 5.0, 0.0, 0.0]))
//!     .collect();
//! let recording = Recording::new(
//!     RecordingKey::new("1", "ptp", "1"),
//!     200.0,
//!     [MarkerTrajectory::from_positions(MarkerId(1), &positions)],
//! )?;
//!
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//! let output = pipeline.run(vec![recording])?;
//!
//! assert_eq!(output.report.recordings[0].interpolation.interpolated_frames(), 5);
//! assert_eq!(output.smoothed.len(), 1);
//! # Ok::<(), mocap_reduce::ProcessingError>(())
//! ```
//!
//! # Presets
//!
//! ```
//! use mocap_reduce::PipelineConfig;
//!
//! let default_config = PipelineConfig::default();
//! let source_config = PipelineConfig::source_defaults();
//! let strict_config = PipelineConfig::strict();
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod average;
pub mod cli;
pub mod config;
pub mod error;
pub mod interpolate;
pub mod io;
pub mod math;
pub mod pipeline;
pub mod recording;
pub mod reference;
pub mod smooth;
pub mod substitute;
pub mod trim;

// Re-exports for convenient access
pub use average::{
    average_participants, average_trials, AggregateSample, AveragedRecording, AveragedTrajectory,
    GroupKey,
};
pub use config::{InputFormat, PipelineConfig, VelocityAggregation};
pub use error::{ProcessingError, Result};
pub use interpolate::{
    interpolate_recording, interpolate_trajectory, GapKind, GapOutcome, InterpolationReport,
};
pub use io::{CaptureExportFormat, CsvFormat, RecordingReader, RecordingWriter};
pub use pipeline::{Pipeline, PipelineOutput, RunReport};
pub use recording::{
    MarkerId, MarkerSample, MarkerTrajectory, MissingReason, Provenance, Recording, RecordingKey,
    RecordingNote,
};
pub use reference::{select_reference, QualityMetric, ReferenceSet};
pub use smooth::{smooth_recording, SavitzkyGolay};
pub use substitute::substitute_auxiliary;
pub use trim::{trim_recording, TrimReport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
