//! Auxiliary-marker substitution.
//!
//! Capture sessions sometimes lose a base marker and pick the same physical
//! point up again under a fresh temporary id. Before interpolation, each
//! auxiliary sample fills the first base marker that is missing at the same
//! frame. Auxiliary trajectories are dropped afterwards, so the output
//! contains only base markers.

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::recording::{MarkerId, MarkerSample, MarkerTrajectory, Provenance, Recording};

/// Outcome of substitution on one recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionReport {
    /// Auxiliary markers that were dropped.
    pub auxiliary: Vec<MarkerId>,
    /// Samples filled, per base marker.
    pub filled: Vec<(MarkerId, usize)>,
    /// Whether the experiment matched a roster rule.
    pub roster_matched: bool,
}

impl SubstitutionReport {
    /// Total number of substituted samples.
    #[must_use]
    pub fn total_filled(&self) -> usize {
        self.filled.iter().map(|(_, n)| n).sum()
    }
}

/// Fill base-marker holes from auxiliary markers and drop the auxiliaries.
///
/// Base markers come from the roster rule matching the experiment id. A base
/// marker absent from the recording is not created.
///
/// # Errors
///
/// Propagates recording construction errors.
pub fn substitute_auxiliary(
    recording: &Recording,
    config: &PipelineConfig,
) -> Result<(Recording, SubstitutionReport)> {
    let experiment = &recording.key().experiment;
    let (roster, roster_matched) = config.roster.base_markers(experiment);
    if !roster_matched {
        warn!(
            recording = %recording.key(),
            "experiment matches no roster rule, using default base markers"
        );
    }

    let auxiliary: Vec<&MarkerTrajectory> = recording
        .trajectories()
        .filter(|t| !roster.contains(&t.marker()))
        .collect();
    let mut base: Vec<(MarkerId, Vec<MarkerSample>)> = recording
        .trajectories()
        .filter(|t| roster.contains(&t.marker()))
        .map(|t| (t.marker(), t.samples().to_vec()))
        .collect();
    let mut filled = vec![0usize; base.len()];

    for frame in 0..recording.frame_count() {
        for aux in &auxiliary {
            let Some(position) = aux.position(frame) else {
                continue;
            };
            if let Some(slot) = base.iter().position(|(_, s)| !s[frame].is_usable()) {
                base[slot].1[frame] = MarkerSample::with_provenance(position, Provenance::Substituted);
                filled[slot] += 1;
            }
        }
    }

    let report = SubstitutionReport {
        auxiliary: auxiliary.iter().map(|t| t.marker()).collect(),
        filled: base
            .iter()
            .zip(&filled)
            .filter(|(_, n)| **n > 0)
            .map(|((id, _), &n)| (*id, n))
            .collect(),
        roster_matched,
    };
    if !report.auxiliary.is_empty() {
        debug!(
            recording = %recording.key(),
            auxiliary = report.auxiliary.len(),
            filled = report.total_filled(),
            "substituted auxiliary markers"
        );
    }

    let cleaned = recording.derive(
        base.into_iter()
            .map(|(id, samples)| MarkerTrajectory::new(id, samples)),
    )?;
    Ok((cleaned, report))
}
