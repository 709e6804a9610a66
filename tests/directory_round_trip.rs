//! Directory-level runs: reading the input layout, writing every stage, and
//! reading the written files back.

use std::fs;
use std::path::Path;

use mocap_reduce::pipeline::{averaged_path, dirs, recording_path};
use mocap_reduce::{
    CsvFormat, GroupKey, InputFormat, MarkerId, MarkerTrajectory, Pipeline, PipelineConfig,
    Recording, RecordingKey, RecordingReader, RecordingWriter,
};
use tempfile::TempDir;

fn reach(n: usize, scale: f64) -> Vec<Option<[f64; 3]>> {
    (0..n)
        .map(|i| {
            let t = (i as f64 / 120.0).min(1.0);
            let s = t * t * (3.0 - 2.0 * t);
            Some([scale * 400.0 * s, 150.0 * s, 20.0])
        })
        .collect()
}

fn write_input(root: &Path, participant: &str, trial: &str, frames: usize, scale: f64) -> Recording {
    let mut positions = reach(frames, scale);
    for p in &mut positions[30..34] {
        *p = None;
    }
    let recording = Recording::new(
        RecordingKey::new(participant, "ptp", trial),
        200.0,
        [MarkerTrajectory::from_positions(MarkerId(1), &positions)],
    )
    .unwrap();
    CsvFormat::default()
        .write_path(&recording, &recording_path(root, recording.key()))
        .unwrap();
    recording
}

#[test]
fn test_run_directory_writes_every_stage() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    write_input(input.path(), "1", "1", 260, 1.0);
    write_input(input.path(), "1", "2", 240, 1.1);
    write_input(input.path(), "2", "1", 250, 0.9);

    // Unreadable and misplaced files are skipped, not fatal
    fs::create_dir_all(input.path().join("3").join("ptp")).unwrap();
    fs::write(input.path().join("3").join("ptp").join("1.csv"), "nothing;useful\n1;2\n").unwrap();
    fs::write(input.path().join("stray.csv"), "Frame;1_X;1_Y;1_Z\n0;1;2;3\n").unwrap();
    fs::write(input.path().join("notes.txt"), "ignored").unwrap();

    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let result = pipeline.run_directory(input.path(), output.path()).unwrap();

    assert_eq!(result.report.recordings.len(), 3);
    assert_eq!(result.report.skipped.len(), 2);

    let root = output.path();
    for participant_trial in [("1", "1"), ("1", "2"), ("2", "1")] {
        let key = RecordingKey::new(participant_trial.0, "ptp", participant_trial.1);
        assert!(recording_path(&root.join(dirs::INTERPOLATED), &key).is_file());
        assert!(recording_path(&root.join(dirs::TRIMMED), &key).is_file());
    }
    assert!(averaged_path(&root.join(dirs::PARTICIPANT_MEANS), &GroupKey::participant("1", "ptp")).is_file());
    assert!(averaged_path(&root.join(dirs::PARTICIPANT_MEANS), &GroupKey::participant("2", "ptp")).is_file());
    let experiment = GroupKey::experiment("ptp");
    assert!(averaged_path(&root.join(dirs::EXPERIMENT_MEANS), &experiment).is_file());

    let smoothed = fs::read_to_string(averaged_path(&root.join(dirs::SMOOTHED), &experiment)).unwrap();
    let header = smoothed.lines().next().unwrap();
    assert_eq!(header, "Frame;1_X;1_Y;1_Z;1_N;1_SD_X;1_SD_Y;1_SD_Z");
    assert_eq!(smoothed.lines().count(), result.smoothed[0].frame_count() + 1);
}

#[test]
fn test_trimmed_files_read_back() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_input(input.path(), "7", "3", 300, 1.0);

    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let result = pipeline.run_directory(input.path(), output.path()).unwrap();
    let trimmed = &result.trimmed[0];

    let path = recording_path(&output.path().join(dirs::TRIMMED), trimmed.key());
    let back = CsvFormat::default()
        .read_path(&path, trimmed.key().clone(), 200.0)
        .unwrap();
    assert_eq!(back.frame_count(), trimmed.frame_count());
    assert!(back.frame_count() < 300);

    // Provenance is not stored on disk; coordinates are.
    let a = back.marker(MarkerId(1)).unwrap();
    let b = trimmed.marker(MarkerId(1)).unwrap();
    for frame in 0..back.frame_count() {
        assert_eq!(a.position(frame), b.position(frame));
    }
}

#[test]
fn test_german_thousand_separators_in_input() {
    let input = TempDir::new().unwrap();
    let dir = input.path().join("1").join("kreis");
    fs::create_dir_all(&dir).unwrap();
    let mut text = String::from("Frame;1_X;1_Y;1_Z\n");
    for i in 0..80 {
        text.push_str(&format!("{i};1.200.{i};2;3\n"));
    }
    fs::write(dir.join("1.csv"), text).unwrap();

    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let (recordings, skipped) = pipeline.load_directory(input.path()).unwrap();
    assert!(skipped.is_empty());
    let t = recordings[0].marker(MarkerId(1)).unwrap();
    assert_eq!(t.position(0), Some([1200.0, 2.0, 3.0]));
    assert_eq!(t.position(12), Some([1200.12, 2.0, 3.0]));
}

#[test]
fn test_capture_export_input() {
    let input = TempDir::new().unwrap();
    let dir = input.path().join("1").join("ptp");
    fs::create_dir_all(&dir).unwrap();
    let mut text = String::from("TRAJECTORIES\nFrame Rate;200\n;*1;;\nField #;X;Y;Z\n");
    for i in 0..90 {
        text.push_str(&format!("{};{};0;0\n", i + 1, i * 4));
    }
    fs::write(dir.join("1.csv"), text).unwrap();

    let mut config = PipelineConfig::default();
    config.io.input_format = InputFormat::CaptureExport;
    let pipeline = Pipeline::new(config).unwrap();
    let (recordings, skipped) = pipeline.load_directory(input.path()).unwrap();
    assert!(skipped.is_empty());
    assert_eq!(recordings[0].frame_count(), 90);
    assert_eq!(recordings[0].marker(MarkerId(1)).unwrap().position(3), Some([12.0, 0.0, 0.0]));
}

#[test]
fn test_blocked_output_path_does_not_stop_other_writes() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_input(input.path(), "1", "1", 260, 1.0);
    write_input(input.path(), "2", "1", 250, 0.9);

    // A plain file where participant 1's interpolated directory should go
    let interpolated = output.path().join(dirs::INTERPOLATED);
    fs::create_dir_all(&interpolated).unwrap();
    fs::write(interpolated.join("1"), "occupied").unwrap();

    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let result = pipeline.run_directory(input.path(), output.path()).unwrap();

    let blocked = recording_path(&interpolated, &RecordingKey::new("1", "ptp", "1"));
    assert_eq!(result.report.skipped.len(), 1);
    assert_eq!(result.report.skipped[0].source, blocked.display().to_string());

    let root = output.path();
    let other = RecordingKey::new("2", "ptp", "1");
    assert!(recording_path(&root.join(dirs::INTERPOLATED), &other).is_file());
    assert!(recording_path(&root.join(dirs::TRIMMED), &other).is_file());
    assert!(recording_path(&root.join(dirs::TRIMMED), &RecordingKey::new("1", "ptp", "1")).is_file());
    assert!(averaged_path(&root.join(dirs::PARTICIPANT_MEANS), &GroupKey::participant("1", "ptp")).is_file());
    assert!(averaged_path(&root.join(dirs::SMOOTHED), &GroupKey::experiment("ptp")).is_file());
    assert_eq!(result.smoothed.len(), 1);
}
