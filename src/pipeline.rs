//! End-to-end reduction of a batch of recordings.
//!
//! [`Pipeline::run`] chains the stages on in-memory recordings:
//!
//! ```text
//! substitute → select references → interpolate → trim
//!            → average trials → average participants → smooth
//! ```
//!
//! Per-recording stages run in parallel with rayon. A recording that fails a
//! stage is reported and dropped without affecting its siblings; an
//! experiment whose anchor markers cannot be resolved at all aborts the run.
//! Output files that cannot be written are reported the same way.
//!
//! [`Pipeline::run_directory`] adds the on-disk layout:
//!
//! | Stage | Path |
//! |-------|------|
//! | input, `interpolated/`, `trimmed/` | `<participant>/<experiment>/<trial>.csv` |
//! | `participant_means/` | `<participant>/<experiment>.csv` |
//! | `experiment_means/`, `smoothed/` | `<experiment>.csv` |

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::average::{average_participants, average_trials, group_participants, group_trials, AveragedRecording, GroupKey};
use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::interpolate::{interpolate_recording, InterpolationReport};
use crate::io::{reader_for, CsvFormat, RecordingWriter};
use crate::recording::{compare_ids, MarkerId, MarkerTrajectory, Recording, RecordingKey, RecordingNote};
use crate::reference::ReferenceSet;
use crate::smooth::smooth_recording;
use crate::substitute::{substitute_auxiliary, SubstitutionReport};
use crate::trim::{trim_recording, TrimReport};

/// Output directory names under the output root.
pub mod dirs {
    pub const INTERPOLATED: &str = "interpolated";
    pub const TRIMMED: &str = "trimmed";
    pub const PARTICIPANT_MEANS: &str = "participant_means";
    pub const EXPERIMENT_MEANS: &str = "experiment_means";
    pub const SMOOTHED: &str = "smoothed";
}

/// What happened to one recording.
#[derive(Debug, Clone)]
pub struct RecordingReport {
    pub key: RecordingKey,
    pub substitution: Option<SubstitutionReport>,
    pub interpolation: InterpolationReport,
    pub trim: TrimReport,
    pub notes: Vec<RecordingNote>,
    /// Interpolated or reference-derived samples left after trimming.
    pub synthetic_samples: usize,
}

/// An input or group that was left out of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    /// File path or group name.
    pub source: String,
    pub reason: String,
}

impl Skipped {
    fn new(source: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            source: source.into(),
            reason: reason.to_string(),
        }
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One entry per recording that made it through trimming, in key order.
    pub recordings: Vec<RecordingReport>,
    /// Anchor markers without a reference, per experiment.
    pub unresolved_references: Vec<(String, MarkerId)>,
    /// Files, recordings and groups that were dropped.
    pub skipped: Vec<Skipped>,
}

impl RunReport {
    /// Recordings with at least one boundary gap left open.
    #[must_use]
    pub fn with_unfilled_boundaries(&self) -> usize {
        self.recordings
            .iter()
            .filter(|r| r.interpolation.unfilled_boundaries() > 0)
            .count()
    }

    /// Synthesised samples across all trimmed recordings.
    #[must_use]
    pub fn synthetic_samples(&self) -> usize {
        self.recordings.iter().map(|r| r.synthetic_samples).sum()
    }

    /// Recordings kept at full length because no motion was found.
    #[must_use]
    pub fn without_motion(&self) -> usize {
        self.recordings
            .iter()
            .filter(|r| r.notes.contains(&RecordingNote::NoMotionDetected))
            .count()
    }
}

/// Every intermediate stage of a run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub interpolated: Vec<Recording>,
    pub trimmed: Vec<Recording>,
    pub participant_means: Vec<AveragedRecording>,
    pub experiment_means: Vec<AveragedRecording>,
    pub smoothed: Vec<AveragedRecording>,
    pub report: RunReport,
}

/// Configured pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

fn sort_by_key(recordings: &mut [Recording]) {
    recordings.sort_by(|a, b| {
        let (ka, kb) = (a.key(), b.key());
        ka.experiment
            .cmp(&kb.experiment)
            .then_with(|| compare_ids(&ka.participant, &kb.participant))
            .then_with(|| compare_ids(&ka.trial, &kb.trial))
    });
}

impl Pipeline {
    /// Create a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Replace auxiliary markers by base-marker substitution, if enabled.
    ///
    /// Recordings are returned in key order. Without substitution the reports
    /// are `None`.
    #[must_use]
    pub fn clean(
        &self,
        mut recordings: Vec<Recording>,
    ) -> (Vec<(Recording, Option<SubstitutionReport>)>, Vec<Skipped>) {
        sort_by_key(&mut recordings);
        if !self.config.roster.substitute_auxiliary {
            return (recordings.into_iter().map(|r| (r, None)).collect(), Vec::new());
        }

        let results: Vec<_> = recordings
            .par_iter()
            .map(|r| (r.key().clone(), substitute_auxiliary(r, &self.config)))
            .collect();
        let mut cleaned = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for (key, result) in results {
            match result {
                Ok((recording, report)) => cleaned.push((recording, Some(report))),
                Err(err) => {
                    warn!(recording = %key, "substitution failed: {err}");
                    skipped.push(Skipped::new(key.to_string(), err));
                }
            }
        }
        (cleaned, skipped)
    }

    /// Run every stage on a batch of recordings.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::ReferenceUnresolved`] if an experiment has
    /// anchor markers but none can be resolved and references are required.
    /// Failures of single recordings or groups are reported, not returned.
    pub fn run(&self, recordings: Vec<Recording>) -> Result<PipelineOutput> {
        let config = &self.config;
        info!(recordings = recordings.len(), "pipeline started");

        let (cleaned, mut skipped) = self.clean(recordings);
        let (cleaned, substitutions): (Vec<Recording>, Vec<Option<SubstitutionReport>>) =
            cleaned.into_iter().unzip();

        // Reference selection per experiment
        let experiments: BTreeSet<&str> = cleaned.iter().map(|r| r.key().experiment.as_str()).collect();
        let all: Vec<&Recording> = cleaned.iter().collect();
        let mut references: BTreeMap<&str, ReferenceSet<'_>> = BTreeMap::new();
        let mut unresolved_references = Vec::new();
        for experiment in experiments {
            let set = ReferenceSet::resolve(experiment, &all, config);
            set.ensure_resolved(config)?;
            unresolved_references.extend(set.unresolved().iter().map(|&m| (experiment.to_string(), m)));
            references.insert(experiment, set);
        }

        // Interpolation and trimming per recording
        let staged: Vec<_> = cleaned
            .par_iter()
            .zip(substitutions.into_par_iter())
            .map(|(recording, substitution)| {
                let empty;
                let set = match references.get(recording.key().experiment.as_str()) {
                    Some(set) => set,
                    None => {
                        empty = ReferenceSet::empty(&recording.key().experiment);
                        &empty
                    }
                };
                let result = interpolate_recording(recording, set, config).map(|interpolated| {
                    let trimmed = trim_recording(&interpolated.recording, config);
                    (interpolated, trimmed, substitution)
                });
                (recording.key().clone(), result)
            })
            .collect();

        let mut interpolated = Vec::with_capacity(staged.len());
        let mut trimmed = Vec::with_capacity(staged.len());
        let mut reports = Vec::with_capacity(staged.len());
        for (key, result) in staged {
            match result {
                Ok((i, t, substitution)) => {
                    reports.push(RecordingReport {
                        key,
                        substitution,
                        interpolation: i.report,
                        trim: t.report,
                        notes: t.recording.notes().to_vec(),
                        synthetic_samples: t
                            .recording
                            .trajectories()
                            .map(MarkerTrajectory::synthetic_count)
                            .sum(),
                    });
                    interpolated.push(i.recording);
                    trimmed.push(t.recording);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(recording = %key, "interpolation failed: {err}");
                    skipped.push(Skipped::new(key.to_string(), err));
                }
            }
        }
        info!(recordings = trimmed.len(), "interpolated and trimmed");

        // Within-participant averaging
        let trial_groups = group_trials(&trimmed);
        let participant_results: Vec<(GroupKey, Result<AveragedRecording>)> = trial_groups
            .into_par_iter()
            .map(|(key, members)| {
                let result = average_trials(&members, config);
                (key, result)
            })
            .collect();
        let participant_means = collect_groups(participant_results, &mut skipped)?;

        // Across-participant averaging
        let experiment_groups = group_participants(&participant_means);
        let experiment_results: Vec<(GroupKey, Result<AveragedRecording>)> = experiment_groups
            .into_par_iter()
            .map(|(experiment, members)| {
                let result = average_participants(&members, config);
                (GroupKey::experiment(experiment), result)
            })
            .collect();
        let experiment_means = collect_groups(experiment_results, &mut skipped)?;
        info!(
            participants = participant_means.len(),
            experiments = experiment_means.len(),
            "averaged"
        );

        let mut smoothed = experiment_means.clone();
        smoothed
            .par_iter_mut()
            .try_for_each(|aggregate| smooth_recording(aggregate, config))?;

        let report = RunReport {
            recordings: reports,
            unresolved_references,
            skipped,
        };
        info!(
            recordings = report.recordings.len(),
            skipped = report.skipped.len(),
            no_motion = report.without_motion(),
            unfilled = report.with_unfilled_boundaries(),
            synthetic = report.synthetic_samples(),
            "pipeline finished"
        );

        Ok(PipelineOutput {
            interpolated,
            trimmed,
            participant_means,
            experiment_means,
            smoothed,
            report,
        })
    }

    /// Read every recording under `input`.
    ///
    /// Files that cannot be read or parsed are returned as skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is not a directory or the configured
    /// delimiter is unusable.
    pub fn load_directory(&self, input: &Path) -> Result<(Vec<Recording>, Vec<Skipped>)> {
        if !input.is_dir() {
            return Err(ProcessingError::io(
                input,
                std::io::Error::new(std::io::ErrorKind::NotFound, "input is not a directory"),
            ));
        }
        let reader = reader_for(&self.config)?;
        let sample_rate = self.config.io.sample_rate;

        let mut paths = Vec::new();
        let mut skipped = Vec::new();
        for entry in WalkDir::new(input).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_csv(entry.path()) => {
                    paths.push(entry.into_path());
                }
                Ok(_) => {}
                Err(err) => {
                    let source = err
                        .path()
                        .map_or_else(|| input.display().to_string(), |p| p.display().to_string());
                    warn!(path = %source, "cannot walk: {err}");
                    skipped.push(Skipped::new(source, err));
                }
            }
        }

        let results: Vec<(PathBuf, Result<Recording>)> = paths
            .into_par_iter()
            .map(|path| {
                let result = recording_key(input, &path)
                    .and_then(|key| reader.read_path(&path, key, sample_rate));
                (path, result)
            })
            .collect();

        let mut recordings = Vec::with_capacity(results.len());
        for (path, result) in results {
            match result {
                Ok(recording) => {
                    debug!(path = %path.display(), frames = recording.frame_count(), "loaded");
                    recordings.push(recording);
                }
                Err(err) => {
                    warn!(path = %path.display(), "skipping file: {err}");
                    skipped.push(Skipped::new(path.display().to_string(), err));
                }
            }
        }
        info!(loaded = recordings.len(), skipped = skipped.len(), input = %input.display(), "input read");
        Ok((recordings, skipped))
    }

    /// Read `input`, run every stage and write all stages under `output`.
    ///
    /// Files that cannot be written are added to the report's skipped list;
    /// the remaining outputs are still written.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be listed or the run fails
    /// fatally.
    pub fn run_directory(&self, input: &Path, output: &Path) -> Result<PipelineOutput> {
        let (recordings, load_skipped) = self.load_directory(input)?;
        let mut result = self.run(recordings)?;
        let mut skipped = load_skipped;
        skipped.append(&mut result.report.skipped);

        let mut write_skipped = self.write_outputs(&result, output)?;
        info!(
            output = %output.display(),
            failed = write_skipped.len(),
            "outputs written"
        );
        skipped.append(&mut write_skipped);
        result.report.skipped = skipped;
        Ok(result)
    }

    /// Write every stage of `result` under `root`.
    ///
    /// Each file is written independently. Returns the files that failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer cannot be built from the configuration.
    pub fn write_outputs(&self, result: &PipelineOutput, root: &Path) -> Result<Vec<Skipped>> {
        let writer = CsvFormat::from_config(&self.config)?;
        let spread = self.config.averaging.include_spread;
        let mut writes: Vec<(PathBuf, Result<()>)> = Vec::new();

        let stages = [
            (dirs::INTERPOLATED, &result.interpolated),
            (dirs::TRIMMED, &result.trimmed),
        ];
        for (dir, recordings) in stages {
            writes.par_extend(recordings.par_iter().map(|r| {
                let path = recording_path(&root.join(dir), r.key());
                let written = writer.write_path(r, &path);
                (path, written)
            }));
        }

        let aggregates = [
            (dirs::PARTICIPANT_MEANS, &result.participant_means),
            (dirs::EXPERIMENT_MEANS, &result.experiment_means),
            (dirs::SMOOTHED, &result.smoothed),
        ];
        for (dir, means) in aggregates {
            writes.par_extend(means.par_iter().map(|a| {
                let path = averaged_path(&root.join(dir), a.key());
                let written = writer.write_averaged_path(a, spread, &path);
                (path, written)
            }));
        }

        let mut failed = Vec::new();
        for (path, written) in writes {
            match written {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(path = %path.display(), "cannot write: {err}");
                    failed.push(Skipped::new(path.display().to_string(), err));
                }
            }
        }
        Ok(failed)
    }
}

fn collect_groups(
    results: Vec<(GroupKey, Result<AveragedRecording>)>,
    skipped: &mut Vec<Skipped>,
) -> Result<Vec<AveragedRecording>> {
    let mut out = Vec::with_capacity(results.len());
    for (key, result) in results {
        match result {
            Ok(aggregate) => out.push(aggregate),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(group = %key, "averaging failed: {err}");
                skipped.push(Skipped::new(key.to_string(), err));
            }
        }
    }
    Ok(out)
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

/// Recording key from `<root>/<participant>/<experiment>/<trial>.csv`.
///
/// # Errors
///
/// Returns [`ProcessingError::InvalidInput`] if `path` is not three levels
/// below `root`.
pub fn recording_key(root: &Path, path: &Path) -> Result<RecordingKey> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ProcessingError::invalid_input(format!("{} is outside {}", path.display(), root.display()))
    })?;
    let parts: Vec<String> = relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    match parts.as_slice() {
        [participant, experiment, trial] => Ok(RecordingKey::new(participant, experiment, trial)),
        _ => Err(ProcessingError::invalid_input(format!(
            "{} is not <participant>/<experiment>/<trial>.csv",
            relative.display()
        ))),
    }
}

/// `<root>/<participant>/<experiment>/<trial>.csv`
#[must_use]
pub fn recording_path(root: &Path, key: &RecordingKey) -> PathBuf {
    root.join(&key.participant)
        .join(&key.experiment)
        .join(format!("{}.csv", key.trial))
}

/// `<root>/<participant>/<experiment>.csv` or `<root>/<experiment>.csv`.
#[must_use]
pub fn averaged_path(root: &Path, key: &GroupKey) -> PathBuf {
    let file = format!("{}.csv", key.experiment);
    match &key.participant {
        Some(participant) => root.join(participant).join(file),
        None => root.join(file),
    }
}
