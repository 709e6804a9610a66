//! Trajectory store: per-marker sample sequences and recording metadata.
//!
//! # Layout
//!
//! | Type | Holds |
//! |------|-------|
//! | [`MarkerSample`] | `[x, y, z]` plus a [`Provenance`] tag |
//! | [`MarkerTrajectory`] | one sample per frame for a single marker |
//! | [`Recording`] | trajectories keyed by [`MarkerId`] plus a [`RecordingKey`] |
//!
//! Frame indices are implicit: sample `i` of a trajectory is frame `i`, so the
//! contiguity invariant holds by construction. [`Recording::new`] enforces the
//! shared frame count.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// Numeric marker identifier as printed in the capture export (`*4` → `4`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MarkerId(pub u32);

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a sample carries no coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingReason {
    /// Missing in the source data, not yet examined.
    Raw,
    /// Internal gap longer than the configured maximum span.
    GapTooLarge,
    /// Boundary gap with no usable reference.
    UnfilledBoundary,
    /// Averaged frame with zero contributors.
    InsufficientData,
}

/// Where a sample's coordinates came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Provenance {
    /// Measured by the capture system.
    #[default]
    Original,
    /// Copied from an auxiliary marker during cleaning.
    Substituted,
    /// Filled from neighbouring samples of the same trajectory.
    Interpolated,
    /// Filled from an aligned reference trajectory.
    ReferenceDerived,
    /// No coordinates.
    Missing(MissingReason),
}

impl Provenance {
    /// Whether the sample carries coordinates.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        !matches!(self, Self::Missing(_))
    }

    /// Whether the coordinates were synthesised by this crate.
    #[must_use]
    pub const fn is_synthetic(self) -> bool {
        matches!(self, Self::Interpolated | Self::ReferenceDerived)
    }
}

/// One frame of one marker.
#[derive(Debug, Clone, Copy)]
pub struct MarkerSample {
    position: [f64; 3],
    provenance: Provenance,
}

impl MarkerSample {
    /// A measured sample.
    #[must_use]
    pub const fn present(position: [f64; 3]) -> Self {
        Self {
            position,
            provenance: Provenance::Original,
        }
    }

    /// A sample with explicit provenance. A `Missing` provenance discards the
    /// coordinates.
    #[must_use]
    pub fn with_provenance(position: [f64; 3], provenance: Provenance) -> Self {
        if provenance.is_usable() {
            Self {
                position,
                provenance,
            }
        } else {
            Self::missing_because(match provenance {
                Provenance::Missing(reason) => reason,
                _ => MissingReason::Raw,
            })
        }
    }

    /// A sample missing in the source data.
    #[must_use]
    pub const fn missing() -> Self {
        Self::missing_because(MissingReason::Raw)
    }

    /// A missing sample with a specific reason.
    #[must_use]
    pub const fn missing_because(reason: MissingReason) -> Self {
        Self {
            position: [f64::NAN; 3],
            provenance: Provenance::Missing(reason),
        }
    }

    /// Build from an optional position; `None` or any non-finite coordinate
    /// yields a raw missing sample.
    #[must_use]
    pub fn from_option(position: Option<[f64; 3]>) -> Self {
        match position {
            Some(p) if p.iter().all(|v| v.is_finite()) => Self::present(p),
            _ => Self::missing(),
        }
    }

    /// Coordinates, if the sample has any.
    #[must_use]
    pub fn position(&self) -> Option<[f64; 3]> {
        self.provenance.is_usable().then_some(self.position)
    }

    /// Provenance tag.
    #[must_use]
    pub const fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Whether the sample carries coordinates.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.provenance.is_usable()
    }

    /// Replace the reason on a missing sample; usable samples are returned as is.
    #[must_use]
    pub const fn reflag(self, reason: MissingReason) -> Self {
        if self.provenance.is_usable() {
            self
        } else {
            Self::missing_because(reason)
        }
    }
}

impl PartialEq for MarkerSample {
    fn eq(&self, other: &Self) -> bool {
        // Coordinates of missing samples are meaningless.
        self.provenance == other.provenance
            && (!self.provenance.is_usable() || self.position == other.position)
    }
}

/// A contiguous run of frames `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRun {
    pub start: usize,
    pub end: usize,
}

impl FrameRun {
    /// Number of frames in the run.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the run is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Ordered samples of one marker within one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerTrajectory {
    marker: MarkerId,
    samples: Vec<MarkerSample>,
}

impl MarkerTrajectory {
    /// Create from samples.
    #[must_use]
    pub const fn new(marker: MarkerId, samples: Vec<MarkerSample>) -> Self {
        Self { marker, samples }
    }

    /// Create from optional positions (`None` = missing).
    #[must_use]
    pub fn from_positions(marker: MarkerId, positions: &[Option<[f64; 3]>]) -> Self {
        Self::new(
            marker,
            positions.iter().copied().map(MarkerSample::from_option).collect(),
        )
    }

    /// Create a fully measured trajectory.
    #[must_use]
    pub fn from_points(marker: MarkerId, points: &[[f64; 3]]) -> Self {
        Self::new(marker, points.iter().copied().map(MarkerSample::present).collect())
    }

    #[must_use]
    pub const fn marker(&self) -> MarkerId {
        self.marker
    }

    #[must_use]
    pub fn samples(&self) -> &[MarkerSample] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `frame`.
    #[must_use]
    pub fn get(&self, frame: usize) -> Option<&MarkerSample> {
        self.samples.get(frame)
    }

    /// Coordinates at `frame`, if present.
    #[must_use]
    pub fn position(&self, frame: usize) -> Option<[f64; 3]> {
        self.samples.get(frame).and_then(MarkerSample::position)
    }

    /// Number of usable samples.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_usable()).count()
    }

    /// Fraction of usable samples; 0 for an empty trajectory.
    #[must_use]
    pub fn valid_fraction(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.valid_count() as f64 / self.samples.len() as f64
        }
    }

    /// Maximal runs of usable samples, in frame order.
    #[must_use]
    pub fn valid_runs(&self) -> Vec<FrameRun> {
        self.runs_where(MarkerSample::is_usable)
    }

    /// Maximal runs of missing samples, in frame order.
    #[must_use]
    pub fn missing_runs(&self) -> Vec<FrameRun> {
        self.runs_where(|s| !s.is_usable())
    }

    fn runs_where(&self, pred: impl Fn(&MarkerSample) -> bool) -> Vec<FrameRun> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, sample) in self.samples.iter().enumerate() {
            match (pred(sample), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push(FrameRun { start: s, end: i });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(FrameRun {
                start: s,
                end: self.samples.len(),
            });
        }
        runs
    }

    /// Copy of the first `frames` samples.
    #[must_use]
    pub fn truncated(&self, frames: usize) -> Self {
        Self::new(
            self.marker,
            self.samples[..frames.min(self.samples.len())].to_vec(),
        )
    }

    /// Frames whose coordinates were filled by interpolation or a reference.
    #[must_use]
    pub fn synthetic_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.provenance().is_synthetic())
            .count()
    }
}

/// Identity of one recording: (participant, experiment, trial).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordingKey {
    pub participant: String,
    pub experiment: String,
    pub trial: String,
}

impl RecordingKey {
    #[must_use]
    pub fn new(
        participant: impl Into<String>,
        experiment: impl Into<String>,
        trial: impl Into<String>,
    ) -> Self {
        Self {
            participant: participant.into(),
            experiment: experiment.into(),
            trial: trial.into(),
        }
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.participant, self.experiment, self.trial)
    }
}

/// Compare identifiers numerically when both are integers, lexically otherwise.
///
/// Keeps `P2` < `P10` style ids in the order a reader expects only when they
/// are bare numbers; mixed ids fall back to string order.
#[must_use]
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Recording-scoped observations attached by processing stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingNote {
    /// The trimmer found no sustained motion; full length kept.
    NoMotionDetected,
    /// An anchor marker had no reference for boundary filling.
    NoReferenceAvailable(MarkerId),
}

/// One capture of one trial: marker trajectories sharing a frame count.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    key: RecordingKey,
    sample_rate: f64,
    frame_count: usize,
    markers: BTreeMap<MarkerId, MarkerTrajectory>,
    notes: Vec<RecordingNote>,
}

impl Recording {
    /// Create a recording, checking the shared frame count.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::InconsistentRecording`] if trajectories differ
    /// in length, or [`ProcessingError::InvalidConfig`] for a non-positive
    /// sample rate.
    pub fn new(
        key: RecordingKey,
        sample_rate: f64,
        trajectories: impl IntoIterator<Item = MarkerTrajectory>,
    ) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ProcessingError::invalid_config(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        let mut markers = BTreeMap::new();
        let mut frame_count = None;
        for trajectory in trajectories {
            let expected = *frame_count.get_or_insert(trajectory.len());
            if trajectory.len() != expected {
                return Err(ProcessingError::InconsistentRecording {
                    marker: trajectory.marker(),
                    expected,
                    actual: trajectory.len(),
                });
            }
            markers.insert(trajectory.marker(), trajectory);
        }
        Ok(Self {
            key,
            sample_rate,
            frame_count: frame_count.unwrap_or(0),
            markers,
            notes: Vec::new(),
        })
    }

    /// New recording with the same metadata and notes but different
    /// trajectories.
    ///
    /// # Errors
    ///
    /// Same as [`Recording::new`].
    pub fn derive(&self, trajectories: impl IntoIterator<Item = MarkerTrajectory>) -> Result<Self> {
        let mut next = Self::new(self.key.clone(), self.sample_rate, trajectories)?;
        next.notes.clone_from(&self.notes);
        Ok(next)
    }

    #[must_use]
    pub const fn key(&self) -> &RecordingKey {
        &self.key
    }

    #[must_use]
    pub const fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Duration covered by the frames, in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.frame_count as f64 / self.sample_rate
    }

    #[must_use]
    pub fn marker(&self, id: MarkerId) -> Option<&MarkerTrajectory> {
        self.markers.get(&id)
    }

    #[must_use]
    pub fn has_marker(&self, id: MarkerId) -> bool {
        self.markers.contains_key(&id)
    }

    /// Marker ids in ascending order.
    pub fn marker_ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.markers.keys().copied()
    }

    /// Trajectories in ascending marker order.
    pub fn trajectories(&self) -> impl Iterator<Item = &MarkerTrajectory> {
        self.markers.values()
    }

    #[must_use]
    pub fn notes(&self) -> &[RecordingNote] {
        &self.notes
    }

    /// Attach a note once.
    pub fn add_note(&mut self, note: RecordingNote) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    /// Copy keeping only the first `frames` frames of every marker.
    #[must_use]
    pub fn truncated(&self, frames: usize) -> Self {
        let frames = frames.min(self.frame_count);
        Self {
            key: self.key.clone(),
            sample_rate: self.sample_rate,
            frame_count: frames,
            markers: self
                .markers
                .iter()
                .map(|(&id, t)| (id, t.truncated(frames)))
                .collect(),
            notes: self.notes.clone(),
        }
    }
}
