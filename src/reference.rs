//! Reference selection for anchor-marker boundary extrapolation.
//!
//! Every recording of an experiment that contains an anchor marker is a
//! candidate. Candidates are scored by a [`QualityMetric`] and ranked by a
//! documented total order:
//!
//! 1. higher score (`valid_fraction / (1 + penalty * gap_runs)`)
//! 2. ascending participant id
//! 3. ascending trial id
//!
//! The longest valid run is measured for display but does not rank.
//!
//! Identifiers compare numerically when both are integers (see
//! [`compare_ids`]). Selection is pure: candidates are borrowed, never copied
//! or modified, and the winner is handed to the interpolator by reference.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::recording::{compare_ids, MarkerId, MarkerTrajectory, Recording};

/// Data-quality summary of one marker trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetric {
    /// Usable samples / total frames.
    pub valid_fraction: f64,
    /// Number of separate runs of missing samples.
    pub gap_runs: usize,
    /// Length of the longest run of usable samples. Reported, not ranked.
    pub longest_valid_run: usize,
}

impl QualityMetric {
    /// Measure a trajectory.
    #[must_use]
    pub fn of(trajectory: &MarkerTrajectory) -> Self {
        Self {
            valid_fraction: trajectory.valid_fraction(),
            gap_runs: trajectory.missing_runs().len(),
            longest_valid_run: trajectory
                .valid_runs()
                .iter()
                .map(|r| r.len())
                .max()
                .unwrap_or(0),
        }
    }

    /// Fragmentation-weighted score.
    #[must_use]
    pub fn score(&self, fragmentation_penalty: f64) -> f64 {
        self.valid_fraction / (1.0 + fragmentation_penalty * self.gap_runs as f64)
    }

    /// Whether the trajectory has any usable sample.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.valid_fraction > 0.0
    }
}

/// A recording scored for one marker.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceCandidate<'a> {
    pub recording: &'a Recording,
    pub marker: MarkerId,
    pub metric: QualityMetric,
    pub score: f64,
}

impl<'a> ReferenceCandidate<'a> {
    /// The candidate's trajectory for its marker.
    #[must_use]
    pub fn trajectory(&self) -> Option<&'a MarkerTrajectory> {
        self.recording.marker(self.marker)
    }
}

/// Total order over candidates: best first.
#[must_use]
pub fn compare_candidates(a: &ReferenceCandidate<'_>, b: &ReferenceCandidate<'_>) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| compare_ids(&a.recording.key().participant, &b.recording.key().participant))
        .then_with(|| compare_ids(&a.recording.key().trial, &b.recording.key().trial))
}

/// Score every recording of `experiment` that contains `marker`, best first.
///
/// Candidates without any usable sample are included (score 0) so callers can
/// report them; [`select_reference`] skips them.
pub fn rank_candidates<'a>(
    experiment: &str,
    recordings: &[&'a Recording],
    marker: MarkerId,
    config: &PipelineConfig,
) -> Vec<ReferenceCandidate<'a>> {
    let penalty = config.reference.fragmentation_penalty;
    let mut candidates: Vec<ReferenceCandidate<'a>> = recordings
        .par_iter()
        .filter(|r| r.key().experiment == experiment)
        .filter_map(|&recording| {
            let metric = QualityMetric::of(recording.marker(marker)?);
            Some(ReferenceCandidate {
                recording,
                marker,
                metric,
                score: metric.score(penalty),
            })
        })
        .collect();
    candidates.sort_by(compare_candidates);
    candidates
}

/// Pick the best reference recording for one anchor marker.
///
/// # Errors
///
/// Returns [`ProcessingError::NoReferenceAvailable`] if no candidate has a
/// usable sample for `marker`.
pub fn select_reference<'a>(
    experiment: &str,
    recordings: &[&'a Recording],
    marker: MarkerId,
    config: &PipelineConfig,
) -> Result<ReferenceCandidate<'a>> {
    rank_candidates(experiment, recordings, marker, config)
        .into_iter()
        .find(|c| c.metric.has_data())
        .ok_or_else(|| ProcessingError::no_reference(experiment, marker))
}

/// Selected references for all anchor markers of one experiment.
#[derive(Debug, Clone)]
pub struct ReferenceSet<'a> {
    experiment: String,
    selected: BTreeMap<MarkerId, ReferenceCandidate<'a>>,
    unresolved: Vec<MarkerId>,
}

impl<'a> ReferenceSet<'a> {
    /// Resolve every configured anchor marker that occurs in the experiment.
    ///
    /// Anchors absent from every recording are ignored; anchors present but
    /// without usable data are recorded as unresolved.
    #[must_use]
    pub fn resolve(
        experiment: &str,
        recordings: &[&'a Recording],
        config: &PipelineConfig,
    ) -> Self {
        let mut selected = BTreeMap::new();
        let mut unresolved = Vec::new();

        for &marker in &config.reference.anchor_markers {
            let present = recordings
                .iter()
                .any(|r| r.key().experiment == experiment && r.has_marker(marker));
            if !present {
                continue;
            }
            match select_reference(experiment, recordings, marker, config) {
                Ok(candidate) => {
                    debug!(
                        experiment,
                        %marker,
                        source = %candidate.recording.key(),
                        score = candidate.score,
                        "reference selected"
                    );
                    selected.insert(marker, candidate);
                }
                Err(err) => {
                    warn!(experiment, %marker, "{err}");
                    unresolved.push(marker);
                }
            }
        }

        Self {
            experiment: experiment.to_string(),
            selected,
            unresolved,
        }
    }

    /// An empty set: every boundary gap stays unfilled.
    #[must_use]
    pub fn empty(experiment: &str) -> Self {
        Self {
            experiment: experiment.to_string(),
            selected: BTreeMap::new(),
            unresolved: Vec::new(),
        }
    }

    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Reference trajectory for `marker`.
    #[must_use]
    pub fn trajectory(&self, marker: MarkerId) -> Option<&'a MarkerTrajectory> {
        self.selected.get(&marker).and_then(ReferenceCandidate::trajectory)
    }

    /// Anchor markers present in the data but without any usable reference.
    #[must_use]
    pub fn unresolved(&self) -> &[MarkerId] {
        &self.unresolved
    }

    /// Resolved anchor markers in ascending order.
    pub fn resolved(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.selected.keys().copied()
    }

    /// Fail when anchors exist for this experiment but none resolved.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::ReferenceUnresolved`] when
    /// `require_references` is set and every present anchor is unresolved.
    pub fn ensure_resolved(&self, config: &PipelineConfig) -> Result<()> {
        if config.reference.require_references
            && self.selected.is_empty()
            && !self.unresolved.is_empty()
        {
            return Err(ProcessingError::ReferenceUnresolved(self.experiment.clone()));
        }
        Ok(())
    }
}
