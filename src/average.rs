//! Per-frame averaging of trials and participants.
//!
//! Averaging runs in two levels:
//!
//! 1. [`average_trials`]: trimmed recordings of one participant and one
//!    experiment, giving a participant-level [`AveragedRecording`].
//! 2. [`average_participants`]: participant-level aggregates of one
//!    experiment, giving the experiment-level aggregate.
//!
//! Both levels use the same variable-count policy. Frame `i` averages every
//! input that has a usable sample at `i`, so trials of different length
//! contribute only to the frames they cover. Missing samples are left out of
//! the count instead of being treated as zero. A frame nobody contributes to
//! has no mean and is flagged [`MissingReason::InsufficientData`].

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::recording::{compare_ids, FrameRun, MarkerId, MissingReason, Recording};

/// Identity of an averaging group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// `None` for experiment-level aggregates.
    pub participant: Option<String>,
    pub experiment: String,
}

impl GroupKey {
    /// Group of one participant's trials of an experiment.
    #[must_use]
    pub fn participant(participant: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self {
            participant: Some(participant.into()),
            experiment: experiment.into(),
        }
    }

    /// Group of all participants of an experiment.
    #[must_use]
    pub fn experiment(experiment: impl Into<String>) -> Self {
        Self {
            participant: None,
            experiment: experiment.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.participant {
            Some(p) => write!(f, "{p}/{}", self.experiment),
            None => write!(f, "{}", self.experiment),
        }
    }
}

/// One averaged frame of one marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSample {
    /// Unweighted mean of the contributors.
    pub mean: Option<[f64; 3]>,
    /// Per-axis sample standard deviation; needs two contributors.
    pub spread: Option<[f64; 3]>,
    /// Number of inputs with a usable sample at this frame.
    pub count: usize,
}

impl AggregateSample {
    /// A frame without contributors.
    pub const EMPTY: Self = Self {
        mean: None,
        spread: None,
        count: 0,
    };

    /// Aggregate a set of points.
    #[must_use]
    pub fn from_points(points: &[[f64; 3]], include_spread: bool) -> Self {
        let count = points.len();
        if count == 0 {
            return Self::EMPTY;
        }
        let n = count as f64;
        let mut mean = [0.0; 3];
        for p in points {
            for axis in 0..3 {
                mean[axis] += p[axis];
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let spread = (include_spread && count >= 2).then(|| {
            let mut var = [0.0; 3];
            for p in points {
                for axis in 0..3 {
                    let d = p[axis] - mean[axis];
                    var[axis] += d * d;
                }
            }
            var.map(|v| (v / (n - 1.0)).sqrt())
        });

        Self {
            mean: Some(mean),
            spread,
            count,
        }
    }

    /// Whether the frame has a mean.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.mean.is_some()
    }

    /// Reason the frame has no mean, if it has none.
    #[must_use]
    pub const fn missing_reason(&self) -> Option<MissingReason> {
        if self.mean.is_some() {
            None
        } else {
            Some(MissingReason::InsufficientData)
        }
    }
}

/// Averaged samples of one marker.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedTrajectory {
    marker: MarkerId,
    samples: Vec<AggregateSample>,
}

impl AveragedTrajectory {
    #[must_use]
    pub const fn new(marker: MarkerId, samples: Vec<AggregateSample>) -> Self {
        Self { marker, samples }
    }

    #[must_use]
    pub const fn marker(&self) -> MarkerId {
        self.marker
    }

    #[must_use]
    pub fn samples(&self) -> &[AggregateSample] {
        &self.samples
    }

    /// Mutable samples; the length is fixed.
    pub fn samples_mut(&mut self) -> &mut [AggregateSample] {
        &mut self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean at `frame`, if any.
    #[must_use]
    pub fn position(&self, frame: usize) -> Option<[f64; 3]> {
        self.samples.get(frame).and_then(|s| s.mean)
    }

    /// Maximal runs of frames that have a mean.
    #[must_use]
    pub fn valid_runs(&self) -> Vec<FrameRun> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, s) in self.samples.iter().enumerate() {
            match (s.is_usable(), start) {
                (true, None) => start = Some(i),
                (false, Some(st)) => {
                    runs.push(FrameRun { start: st, end: i });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(st) = start {
            runs.push(FrameRun {
                start: st,
                end: self.samples.len(),
            });
        }
        runs
    }
}

/// Aggregate of a group of recordings or of lower-level aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedRecording {
    key: GroupKey,
    sample_rate: f64,
    frame_count: usize,
    input_count: usize,
    markers: BTreeMap<MarkerId, AveragedTrajectory>,
}

impl AveragedRecording {
    #[must_use]
    pub const fn key(&self) -> &GroupKey {
        &self.key
    }

    #[must_use]
    pub const fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Frame count: the longest input.
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of inputs averaged into this aggregate.
    #[must_use]
    pub const fn input_count(&self) -> usize {
        self.input_count
    }

    #[must_use]
    pub fn marker(&self, id: MarkerId) -> Option<&AveragedTrajectory> {
        self.markers.get(&id)
    }

    pub fn marker_ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.markers.keys().copied()
    }

    pub fn trajectories(&self) -> impl Iterator<Item = &AveragedTrajectory> {
        self.markers.values()
    }

    pub fn trajectories_mut(&mut self) -> impl Iterator<Item = &mut AveragedTrajectory> {
        self.markers.values_mut()
    }
}

/// Anything averaging can read positions from.
pub trait FrameSource {
    fn sample_rate(&self) -> f64;
    fn frame_count(&self) -> usize;
    fn marker_ids(&self) -> Vec<MarkerId>;
    fn position(&self, marker: MarkerId, frame: usize) -> Option<[f64; 3]>;
}

impl FrameSource for Recording {
    fn sample_rate(&self) -> f64 {
        Recording::sample_rate(self)
    }

    fn frame_count(&self) -> usize {
        Recording::frame_count(self)
    }

    fn marker_ids(&self) -> Vec<MarkerId> {
        Recording::marker_ids(self).collect()
    }

    fn position(&self, marker: MarkerId, frame: usize) -> Option<[f64; 3]> {
        self.marker(marker).and_then(|t| t.position(frame))
    }
}

impl FrameSource for AveragedRecording {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn marker_ids(&self) -> Vec<MarkerId> {
        self.markers.keys().copied().collect()
    }

    fn position(&self, marker: MarkerId, frame: usize) -> Option<[f64; 3]> {
        self.marker(marker).and_then(|t| t.position(frame))
    }
}

/// Per-frame variable-count average over `inputs`.
///
/// # Errors
///
/// Returns [`ProcessingError::EmptyGroup`] for no inputs and
/// [`ProcessingError::SampleRateMismatch`] if the inputs disagree on rate.
pub fn average_frames<S: FrameSource>(
    key: GroupKey,
    inputs: &[&S],
    config: &PipelineConfig,
) -> Result<AveragedRecording> {
    let Some(first) = inputs.first() else {
        return Err(ProcessingError::empty_group(key.to_string()));
    };
    let sample_rate = first.sample_rate();
    if let Some(other) = inputs
        .iter()
        .map(|s| s.sample_rate())
        .find(|&r| (r - sample_rate).abs() > 1e-9 * sample_rate)
    {
        return Err(ProcessingError::SampleRateMismatch {
            group: key.to_string(),
            expected: sample_rate,
            actual: other,
        });
    }

    let frame_count = inputs.iter().map(|s| s.frame_count()).max().unwrap_or(0);
    let mut ids: Vec<MarkerId> = inputs.iter().flat_map(|s| s.marker_ids()).collect();
    ids.sort_unstable();
    ids.dedup();

    let include_spread = config.averaging.include_spread;
    let mut points = Vec::with_capacity(inputs.len());
    let markers = ids
        .into_iter()
        .map(|marker| {
            let samples = (0..frame_count)
                .map(|frame| {
                    points.clear();
                    points.extend(inputs.iter().filter_map(|s| s.position(marker, frame)));
                    AggregateSample::from_points(&points, include_spread)
                })
                .collect();
            (marker, AveragedTrajectory::new(marker, samples))
        })
        .collect();

    debug!(group = %key, inputs = inputs.len(), frames = frame_count, "averaged");

    Ok(AveragedRecording {
        key,
        sample_rate,
        frame_count,
        input_count: inputs.len(),
        markers,
    })
}

/// Average one participant's trials of one experiment.
///
/// # Errors
///
/// Besides the errors of [`average_frames`], returns
/// [`ProcessingError::InvalidInput`] if the recordings belong to different
/// participants or experiments.
pub fn average_trials(recordings: &[&Recording], config: &PipelineConfig) -> Result<AveragedRecording> {
    let Some(first) = recordings.first() else {
        return Err(ProcessingError::empty_group("trials"));
    };
    let key = GroupKey::participant(&first.key().participant, &first.key().experiment);
    if let Some(stray) = recordings.iter().find(|r| {
        r.key().participant != first.key().participant || r.key().experiment != first.key().experiment
    }) {
        return Err(ProcessingError::invalid_input(format!(
            "recording {} does not belong to group {key}",
            stray.key()
        )));
    }
    average_frames(key, recordings, config)
}

/// Average participant-level aggregates of one experiment.
///
/// # Errors
///
/// Besides the errors of [`average_frames`], returns
/// [`ProcessingError::InvalidInput`] if the aggregates belong to different
/// experiments or are not participant-level.
pub fn average_participants(
    participants: &[&AveragedRecording],
    config: &PipelineConfig,
) -> Result<AveragedRecording> {
    let Some(first) = participants.first() else {
        return Err(ProcessingError::empty_group("participants"));
    };
    let key = GroupKey::experiment(&first.key().experiment);
    if let Some(stray) = participants
        .iter()
        .find(|a| a.key().experiment != key.experiment || a.key().participant.is_none())
    {
        return Err(ProcessingError::invalid_input(format!(
            "aggregate {} does not belong to group {key}",
            stray.key()
        )));
    }
    average_frames(key, participants, config)
}

/// Group recordings by (participant, experiment), trials in id order.
#[must_use]
pub fn group_trials(recordings: &[Recording]) -> BTreeMap<GroupKey, Vec<&Recording>> {
    let mut groups: BTreeMap<GroupKey, Vec<&Recording>> = BTreeMap::new();
    for recording in recordings {
        let key = recording.key();
        groups
            .entry(GroupKey::participant(&key.participant, &key.experiment))
            .or_default()
            .push(recording);
    }
    for members in groups.values_mut() {
        members.sort_by(|a, b| compare_ids(&a.key().trial, &b.key().trial));
    }
    groups
}

/// Group participant aggregates by experiment, participants in id order.
#[must_use]
pub fn group_participants(aggregates: &[AveragedRecording]) -> BTreeMap<String, Vec<&AveragedRecording>> {
    let mut groups: BTreeMap<String, Vec<&AveragedRecording>> = BTreeMap::new();
    for aggregate in aggregates {
        groups
            .entry(aggregate.key().experiment.clone())
            .or_default()
            .push(aggregate);
    }
    for members in groups.values_mut() {
        members.sort_by(|a, b| {
            compare_ids(
                a.key().participant.as_deref().unwrap_or_default(),
                b.key().participant.as_deref().unwrap_or_default(),
            )
        });
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{MarkerTrajectory, RecordingKey};
    use approx::assert_relative_eq;

    fn constant(participant: &str, trial: &str, frames: usize, value: f64) -> Recording {
        Recording::new(
            RecordingKey::new(participant, "greifen", trial),
            200.0,
            [MarkerTrajectory::from_points(MarkerId(1), &vec![[value; 3]; frames])],
        )
        .unwrap()
    }

    #[test]
    fn test_variable_length_trials() {
        let a = constant("1", "1", 100, 1.0);
        let b = constant("1", "2", 95, 2.0);
        let c = constant("1", "3", 98, 6.0);
        let avg = average_trials(&[&a, &b, &c], &PipelineConfig::default()).unwrap();

        assert_eq!(avg.frame_count(), 100);
        assert_eq!(avg.input_count(), 3);
        let t = avg.marker(MarkerId(1)).unwrap();
        let counts: Vec<usize> = t.samples().iter().map(|s| s.count).collect();
        assert!(counts[..95].iter().all(|&c| c == 3));
        assert!(counts[95..98].iter().all(|&c| c == 2));
        assert!(counts[98..].iter().all(|&c| c == 1));

        assert_relative_eq!(t.position(0).unwrap()[0], 3.0);
        assert_relative_eq!(t.position(96).unwrap()[0], 3.5);
        assert_relative_eq!(t.position(99).unwrap()[0], 1.0);
    }

    #[test]
    fn test_missing_samples_are_not_zero() {
        let a = constant("1", "1", 3, 4.0);
        let b = Recording::new(
            RecordingKey::new("1", "greifen", "2"),
            200.0,
            [MarkerTrajectory::from_positions(
                MarkerId(1),
                &[Some([8.0; 3]), None, Some([8.0; 3])],
            )],
        )
        .unwrap();
        let avg = average_trials(&[&a, &b], &PipelineConfig::default()).unwrap();
        let t = avg.marker(MarkerId(1)).unwrap();
        assert_eq!(t.samples()[1].count, 1);
        assert_relative_eq!(t.position(1).unwrap()[2], 4.0);
        assert_relative_eq!(t.position(0).unwrap()[2], 6.0);
    }

    #[test]
    fn test_zero_contributors_flagged() {
        let a = Recording::new(
            RecordingKey::new("1", "greifen", "1"),
            200.0,
            [MarkerTrajectory::from_positions(MarkerId(1), &[Some([1.0; 3]), None])],
        )
        .unwrap();
        let avg = average_trials(&[&a], &PipelineConfig::default()).unwrap();
        let s = avg.marker(MarkerId(1)).unwrap().samples()[1];
        assert_eq!(s, AggregateSample::EMPTY);
        assert_eq!(s.missing_reason(), Some(MissingReason::InsufficientData));
    }

    #[test]
    fn test_spread() {
        let s = AggregateSample::from_points(&[[1.0, 0.0, 2.0], [3.0, 0.0, 4.0]], true);
        let spread = s.spread.unwrap();
        assert_relative_eq!(spread[0], std::f64::consts::SQRT_2);
        assert_relative_eq!(spread[1], 0.0);

        assert!(AggregateSample::from_points(&[[1.0; 3]], true).spread.is_none());
        assert!(AggregateSample::from_points(&[[1.0; 3], [2.0; 3]], false)
            .spread
            .is_none());
    }

    #[test]
    fn test_group_errors() {
        let config = PipelineConfig::default();
        assert!(matches!(
            average_trials(&[], &config),
            Err(ProcessingError::EmptyGroup(_))
        ));

        let a = constant("1", "1", 5, 0.0);
        let b = Recording::new(
            RecordingKey::new("1", "greifen", "2"),
            100.0,
            [MarkerTrajectory::from_points(MarkerId(1), &[[0.0; 3]; 5])],
        )
        .unwrap();
        assert!(matches!(
            average_trials(&[&a, &b], &config),
            Err(ProcessingError::SampleRateMismatch { .. })
        ));

        let other = constant("2", "1", 5, 0.0);
        assert!(matches!(
            average_trials(&[&a, &other], &config),
            Err(ProcessingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_participant_level() {
        let config = PipelineConfig::default();
        let p1 = average_trials(&[&constant("1", "1", 10, 2.0), &constant("1", "2", 10, 4.0)], &config)
            .unwrap();
        let p2 = average_trials(&[&constant("2", "1", 6, 9.0)], &config).unwrap();
        let exp = average_participants(&[&p1, &p2], &config).unwrap();

        assert_eq!(exp.key(), &GroupKey::experiment("greifen"));
        assert_eq!(exp.key().to_string(), "greifen");
        let t = exp.marker(MarkerId(1)).unwrap();
        // Participant means are weighted equally regardless of trial count
        assert_relative_eq!(t.position(0).unwrap()[0], 6.0);
        assert_eq!(t.samples()[0].count, 2);
        assert_relative_eq!(t.position(8).unwrap()[0], 3.0);
        assert_eq!(t.samples()[8].count, 1);

        assert!(matches!(
            average_participants(&[&exp], &config),
            Err(ProcessingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_grouping() {
        let recs = vec![
            constant("2", "10", 3, 0.0),
            constant("2", "2", 3, 0.0),
            constant("1", "1", 3, 0.0),
        ];
        let groups = group_trials(&recs);
        assert_eq!(groups.len(), 2);
        let trials: Vec<&str> = groups[&GroupKey::participant("2", "greifen")]
            .iter()
            .map(|r| r.key().trial.as_str())
            .collect();
        assert_eq!(trials, ["2", "10"]);

        let config = PipelineConfig::default();
        let aggregates: Vec<AveragedRecording> = groups
            .values()
            .map(|members| average_trials(members, &config).unwrap())
            .collect();
        let by_experiment = group_participants(&aggregates);
        assert_eq!(by_experiment["greifen"].len(), 2);
    }

    #[test]
    fn test_count_bounded_by_group_size() {
        let config = PipelineConfig::default();
        let recs: Vec<Recording> = (1..=4).map(|t| constant("1", &t.to_string(), 20 + t, 1.0)).collect();
        let refs: Vec<&Recording> = recs.iter().collect();
        let avg = average_trials(&refs, &config).unwrap();
        for s in avg.marker(MarkerId(1)).unwrap().samples() {
            assert!(s.count <= 4);
        }
        assert_eq!(avg.marker(MarkerId(1)).unwrap().samples()[0].count, 4);
    }
}
