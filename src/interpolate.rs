//! Gap interpolation.
//!
//! A single scan splits each trajectory into maximal missing runs, classified
//! by [`GapKind`]. Internal gaps up to `max_gap_span` frames are filled with a
//! [`MonotoneCubic`] through the bounding samples and their nearest valid
//! neighbours. Boundary gaps of anchor markers are filled from the selected
//! reference trajectory: the reference frame whose first difference best
//! matches the recording's slope at the gap's inner edge stands in for that
//! edge, and the copied values are offset so the edge value matches exactly.
//! A trajectory missing every frame copies the reference at the same index.
//!
//! Gaps are always read from the input trajectory; a sample filled by one gap
//! never serves as a knot for another.

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::math::linalg::{add3, norm3_squared, sub3};
use crate::math::MonotoneCubic;
use crate::recording::{
    FrameRun, MarkerId, MarkerSample, MarkerTrajectory, MissingReason, Provenance, Recording,
    RecordingNote,
};
use crate::reference::ReferenceSet;

/// Position of a missing run within its trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapKind {
    /// Valid samples on both sides.
    Internal,
    /// Touches frame 0.
    Leading,
    /// Touches the last frame.
    Trailing,
    /// Every frame is missing.
    Whole,
}

impl GapKind {
    #[must_use]
    pub const fn is_boundary(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

/// A maximal run of missing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub run: FrameRun,
    pub kind: GapKind,
}

/// What happened to one gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapOutcome {
    /// Filled by cubic interpolation.
    Interpolated,
    /// Internal gap longer than the maximum span; left missing.
    TooLarge,
    /// Boundary gap filled (fully or partly) from the reference.
    ReferenceDerived { filled: usize, unfilled: usize },
    /// Boundary gap left missing.
    Unfilled(UnfilledCause),
}

/// Why a boundary gap stayed missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfilledCause {
    /// Marker is not an anchor marker.
    NotAnchor,
    /// Anchor marker without a selected reference.
    NoReference,
    /// No inner edge to align against, or the reference covers no frame.
    NotAlignable,
}

/// Outcome of one gap of one marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapReport {
    pub marker: MarkerId,
    pub gap: Gap,
    pub outcome: GapOutcome,
}

/// All gap outcomes for one recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpolationReport {
    pub gaps: Vec<GapReport>,
}

impl InterpolationReport {
    /// Frames filled by interpolation.
    #[must_use]
    pub fn interpolated_frames(&self) -> usize {
        self.gaps
            .iter()
            .filter(|g| g.outcome == GapOutcome::Interpolated)
            .map(|g| g.gap.run.len())
            .sum()
    }

    /// Frames filled from a reference.
    #[must_use]
    pub fn reference_frames(&self) -> usize {
        self.gaps
            .iter()
            .map(|g| match g.outcome {
                GapOutcome::ReferenceDerived { filled, .. } => filled,
                _ => 0,
            })
            .sum()
    }

    /// Internal gaps left missing because they exceed the maximum span.
    #[must_use]
    pub fn too_large(&self) -> usize {
        self.gaps
            .iter()
            .filter(|g| g.outcome == GapOutcome::TooLarge)
            .count()
    }

    /// Boundary gaps with at least one frame left missing.
    #[must_use]
    pub fn unfilled_boundaries(&self) -> usize {
        self.gaps
            .iter()
            .filter(|g| match g.outcome {
                GapOutcome::Unfilled(_) => true,
                GapOutcome::ReferenceDerived { unfilled, .. } => unfilled > 0,
                _ => false,
            })
            .count()
    }
}

/// An interpolated recording and what was done to it.
#[derive(Debug, Clone)]
pub struct InterpolatedRecording {
    pub recording: Recording,
    pub report: InterpolationReport,
}

/// Classify the missing runs of a trajectory.
#[must_use]
pub fn find_gaps(trajectory: &MarkerTrajectory) -> Vec<Gap> {
    let n = trajectory.len();
    trajectory
        .missing_runs()
        .into_iter()
        .map(|run| {
            let kind = match (run.start == 0, run.end == n) {
                (true, true) => GapKind::Whole,
                (true, false) => GapKind::Leading,
                (false, true) => GapKind::Trailing,
                (false, false) => GapKind::Internal,
            };
            Gap { run, kind }
        })
        .collect()
}

/// Fill the gaps of one trajectory.
///
/// `reference` is used for boundary gaps only when `anchor` is true. Returns
/// the new trajectory and one report per gap; a trajectory without gaps is
/// returned unchanged.
#[must_use]
pub fn interpolate_trajectory(
    trajectory: &MarkerTrajectory,
    reference: Option<&MarkerTrajectory>,
    anchor: bool,
    config: &PipelineConfig,
) -> (MarkerTrajectory, Vec<GapReport>) {
    let gaps = find_gaps(trajectory);
    if gaps.is_empty() {
        return (trajectory.clone(), Vec::new());
    }

    let source = trajectory.samples();
    let mut out = source.to_vec();
    let mut reports = Vec::with_capacity(gaps.len());
    let marker = trajectory.marker();

    for gap in gaps {
        let outcome = if !gap.kind.is_boundary() {
            fill_internal(source, &mut out, gap.run, config)
        } else if !anchor {
            flag(&mut out, gap.run, MissingReason::UnfilledBoundary);
            GapOutcome::Unfilled(UnfilledCause::NotAnchor)
        } else if let Some(reference) = reference {
            fill_boundary(source, &mut out, gap, reference)
        } else {
            flag(&mut out, gap.run, MissingReason::UnfilledBoundary);
            GapOutcome::Unfilled(UnfilledCause::NoReference)
        };
        reports.push(GapReport {
            marker,
            gap,
            outcome,
        });
    }

    (MarkerTrajectory::new(marker, out), reports)
}

/// Fill every trajectory of a recording.
///
/// Anchor markers use `references` for boundary gaps; an anchor with a
/// boundary gap but no reference gets a [`RecordingNote::NoReferenceAvailable`].
///
/// # Errors
///
/// Propagates recording construction errors (frame counts never change here,
/// so this only fails on corrupted input).
pub fn interpolate_recording(
    recording: &Recording,
    references: &ReferenceSet<'_>,
    config: &PipelineConfig,
) -> Result<InterpolatedRecording> {
    let mut report = InterpolationReport::default();
    let mut filled = Vec::new();
    let mut missing_refs = Vec::new();

    for trajectory in recording.trajectories() {
        let marker = trajectory.marker();
        let anchor = config.is_anchor(marker);
        let reference = references.trajectory(marker);
        let (next, gaps) = interpolate_trajectory(trajectory, reference, anchor, config);

        for g in &gaps {
            match g.outcome {
                GapOutcome::TooLarge => warn!(
                    recording = %recording.key(),
                    %marker,
                    start = g.gap.run.start,
                    frames = g.gap.run.len(),
                    "gap too large to interpolate"
                ),
                GapOutcome::Unfilled(UnfilledCause::NoReference) => {
                    missing_refs.push(marker);
                }
                GapOutcome::Unfilled(UnfilledCause::NotAlignable) => warn!(
                    recording = %recording.key(),
                    %marker,
                    "boundary gap could not be aligned to reference"
                ),
                _ => {}
            }
        }

        report.gaps.extend(gaps);
        filled.push(next);
    }

    let mut out = recording.derive(filled)?;
    for marker in missing_refs {
        warn!(recording = %recording.key(), %marker, "no reference for boundary gap");
        out.add_note(RecordingNote::NoReferenceAvailable(marker));
    }

    debug!(
        recording = %recording.key(),
        interpolated = report.interpolated_frames(),
        reference_derived = report.reference_frames(),
        too_large = report.too_large(),
        unfilled_boundaries = report.unfilled_boundaries(),
        "interpolation complete"
    );

    Ok(InterpolatedRecording {
        recording: out,
        report,
    })
}

fn flag(out: &mut [MarkerSample], run: FrameRun, reason: MissingReason) {
    for sample in &mut out[run.start..run.end] {
        *sample = sample.reflag(reason);
    }
}

/// Up to `count` consecutive usable frames walking away from `from`.
fn collect_knots(source: &[MarkerSample], from: usize, backward: bool, count: usize) -> Vec<usize> {
    let mut frames = Vec::with_capacity(count);
    let mut i = from;
    while frames.len() < count && source[i].is_usable() {
        frames.push(i);
        if backward {
            if i == 0 {
                break;
            }
            i -= 1;
        } else {
            i += 1;
            if i >= source.len() {
                break;
            }
        }
    }
    frames
}

fn fill_internal(
    source: &[MarkerSample],
    out: &mut [MarkerSample],
    run: FrameRun,
    config: &PipelineConfig,
) -> GapOutcome {
    if run.len() > config.interpolation.max_gap_span {
        flag(out, run, MissingReason::GapTooLarge);
        return GapOutcome::TooLarge;
    }

    let reach = config.interpolation.neighbor_window + 1;
    let mut knots = collect_knots(source, run.start - 1, true, reach);
    knots.reverse();
    knots.extend(collect_knots(source, run.end, false, reach));

    let xs: Vec<f64> = knots.iter().map(|&f| f as f64).collect();
    let points: Vec<[f64; 3]> = knots.iter().filter_map(|&f| source[f].position()).collect();

    let mut curves = Vec::with_capacity(3);
    for axis in 0..3 {
        let ys: Vec<f64> = points.iter().map(|p| p[axis]).collect();
        match MonotoneCubic::new(&xs, &ys) {
            Ok(curve) => curves.push(curve),
            // Bounding samples always exist for internal gaps; keep the gap
            // flagged if the knot set is somehow degenerate.
            Err(_) => {
                flag(out, run, MissingReason::GapTooLarge);
                return GapOutcome::TooLarge;
            }
        }
    }

    for frame in run.start..run.end {
        let x = frame as f64;
        let position = [curves[0].eval(x), curves[1].eval(x), curves[2].eval(x)];
        out[frame] = MarkerSample::with_provenance(position, Provenance::Interpolated);
    }
    GapOutcome::Interpolated
}

/// Direction the reference is copied relative to the aligned edge frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Leading gap: copy frames before the edge.
    Before,
    /// Trailing gap: copy frames after the edge.
    After,
}

fn fill_boundary(
    source: &[MarkerSample],
    out: &mut [MarkerSample],
    gap: Gap,
    reference: &MarkerTrajectory,
) -> GapOutcome {
    let (edge, direction) = match gap.kind {
        GapKind::Leading => (gap.run.end, Direction::Before),
        GapKind::Trailing => (gap.run.start - 1, Direction::After),
        GapKind::Whole => return fill_whole(out, gap.run, reference),
        GapKind::Internal => {
            flag(out, gap.run, MissingReason::UnfilledBoundary);
            return GapOutcome::Unfilled(UnfilledCause::NotAlignable);
        }
    };

    let Some(edge_value) = source[edge].position() else {
        flag(out, gap.run, MissingReason::UnfilledBoundary);
        return GapOutcome::Unfilled(UnfilledCause::NotAlignable);
    };
    let edge_slope = edge_derivative(source, edge, direction);

    let Some(anchor) = align_reference(reference, gap.run.len(), edge, edge_slope, direction) else {
        flag(out, gap.run, MissingReason::UnfilledBoundary);
        return GapOutcome::Unfilled(UnfilledCause::NotAlignable);
    };
    let Some(anchor_value) = reference.position(anchor) else {
        flag(out, gap.run, MissingReason::UnfilledBoundary);
        return GapOutcome::Unfilled(UnfilledCause::NotAlignable);
    };
    let offset = sub3(&edge_value, &anchor_value);

    let mut filled = 0;
    for d in 1..=gap.run.len() {
        let (target, src) = match direction {
            Direction::Before => (edge - d, anchor.checked_sub(d)),
            Direction::After => (edge + d, Some(anchor + d)),
        };
        match src.and_then(|s| reference.position(s)) {
            Some(p) => {
                out[target] =
                    MarkerSample::with_provenance(add3(&p, &offset), Provenance::ReferenceDerived);
                filled += 1;
            }
            None => out[target] = out[target].reflag(MissingReason::UnfilledBoundary),
        }
    }

    if filled == 0 {
        GapOutcome::Unfilled(UnfilledCause::NotAlignable)
    } else {
        GapOutcome::ReferenceDerived {
            filled,
            unfilled: gap.run.len() - filled,
        }
    }
}

/// Copy the reference frame for frame with no offset: there is no edge to
/// align on.
fn fill_whole(out: &mut [MarkerSample], run: FrameRun, reference: &MarkerTrajectory) -> GapOutcome {
    let mut filled = 0;
    for frame in run.start..run.end {
        match reference.position(frame) {
            Some(p) => {
                out[frame] = MarkerSample::with_provenance(p, Provenance::ReferenceDerived);
                filled += 1;
            }
            None => out[frame] = out[frame].reflag(MissingReason::UnfilledBoundary),
        }
    }

    if filled == 0 {
        GapOutcome::Unfilled(UnfilledCause::NotAlignable)
    } else {
        GapOutcome::ReferenceDerived {
            filled,
            unfilled: run.len() - filled,
        }
    }
}

/// First difference at the edge, pointing into the recording's valid data.
fn edge_derivative(samples: &[MarkerSample], edge: usize, direction: Direction) -> Option<[f64; 3]> {
    let here = samples.get(edge)?.position()?;
    match direction {
        // Forward difference for a leading gap
        Direction::Before => {
            let next = samples.get(edge + 1)?.position()?;
            Some(sub3(&next, &here))
        }
        // Backward difference for a trailing gap
        Direction::After => {
            let prev = samples.get(edge.checked_sub(1)?)?.position()?;
            Some(sub3(&here, &prev))
        }
    }
}

/// Choose the reference frame that stands in for the recording's edge frame.
///
/// Candidates must be usable and have `span` usable reference frames on the
/// gap side. The position is matched exactly by the constant offset applied
/// afterwards, so candidates are ranked by squared slope mismatch against the
/// recording's edge slope; ties go to the frame nearest `edge`, then the
/// earlier one. Without a recording slope every candidate ties and the
/// nearest covered frame wins. When no candidate qualifies the same frame
/// index is used.
fn align_reference(
    reference: &MarkerTrajectory,
    span: usize,
    edge: usize,
    edge_slope: Option<[f64; 3]>,
    direction: Direction,
) -> Option<usize> {
    let samples = reference.samples();
    let n = samples.len();

    // prefix[i] = usable samples in [0, i)
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0usize);
    for s in samples {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + usize::from(s.is_usable()));
    }
    let covered = |r: usize| match direction {
        Direction::Before => r >= span && prefix[r] - prefix[r - span] == span,
        Direction::After => r + span < n && prefix[r + span + 1] - prefix[r + 1] == span,
    };

    let mut best: Option<(f64, usize, usize)> = None;
    for r in 0..n {
        if !samples[r].is_usable() || !covered(r) {
            continue;
        }
        let cost = match edge_slope {
            Some(slope) => match edge_derivative(samples, r, direction) {
                Some(ref_slope) => norm3_squared(&sub3(&ref_slope, &slope)),
                None => continue,
            },
            None => 0.0,
        };
        let distance = r.abs_diff(edge);
        let better = match best {
            None => true,
            Some((c, d, _)) => cost < c || (cost == c && distance < d),
        };
        if better {
            best = Some((cost, distance, r));
        }
    }

    best.map(|(_, _, r)| r)
        .or_else(|| samples.get(edge).filter(|s| s.is_usable()).map(|_| edge))
}
