//! Reading and writing recordings as delimiter-separated text.
//!
//! Two input layouts are understood:
//!
//! - [`CsvFormat`]: one header row `Frame;1_X;1_Y;1_Z;2_X;...` and one row per
//!   frame. This is also the output layout of every stage.
//! - [`CaptureExportFormat`]: the capture system's export, where a row of
//!   `*<id>` marker labels is followed by a row of `X`/`Y`/`Z` coordinate
//!   labels and the frame rows.
//!
//! Numeric fields are read leniently. Blanks inside a value are dropped and
//! dots used as thousand separators are removed (`127.228.226` reads as
//! `127228.226`). A sample is missing when any of its three coordinates is
//! empty, unparsable or not finite.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder, WriterBuilder};

use crate::average::{AggregateSample, AveragedRecording};
use crate::config::{InputFormat, PipelineConfig};
use crate::error::{ProcessingError, Result};
use crate::recording::{MarkerId, MarkerTrajectory, Recording, RecordingKey};

const AXES: [&str; 3] = ["X", "Y", "Z"];

/// Source of recordings.
pub trait RecordingReader: Send + Sync {
    /// Parse one recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a valid recording.
    fn read_from(&self, source: &mut dyn Read, key: RecordingKey, sample_rate: f64) -> Result<Recording>;

    /// Parse one recording from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsed.
    fn read_path(&self, path: &Path, key: RecordingKey, sample_rate: f64) -> Result<Recording> {
        let mut file = File::open(path).map_err(|e| ProcessingError::io(path, e))?;
        self.read_from(&mut file, key, sample_rate)
    }
}

/// Sink for recordings and aggregates.
pub trait RecordingWriter: Send + Sync {
    /// Write one recording.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_to(&self, recording: &Recording, sink: &mut dyn Write) -> Result<()>;

    /// Write one aggregate with per-marker contributor counts and, if
    /// `include_spread`, standard deviations.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_averaged_to(
        &self,
        averaged: &AveragedRecording,
        include_spread: bool,
        sink: &mut dyn Write,
    ) -> Result<()>;

    /// Write one recording to a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    fn write_path(&self, recording: &Recording, path: &Path) -> Result<()> {
        let mut file = create_file(path)?;
        self.write_to(recording, &mut file)
    }

    /// Write one aggregate to a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    fn write_averaged_path(
        &self,
        averaged: &AveragedRecording,
        include_spread: bool,
        path: &Path,
    ) -> Result<()> {
        let mut file = create_file(path)?;
        self.write_averaged_to(averaged, include_spread, &mut file)
    }
}

fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ProcessingError::io(parent, e))?;
    }
    File::create(path).map_err(|e| ProcessingError::io(path, e))
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| ProcessingError::invalid_config(format!("delimiter {delimiter:?} must be ASCII")))
}

/// Parse a coordinate field.
///
/// Returns `None` for empty, unparsable and non-finite values.
#[must_use]
pub fn parse_value(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let normalized = if compact.matches('.').count() > 1 {
        // Every dot but the last is a thousand separator
        let last = compact.rfind('.').unwrap_or(compact.len());
        let (int_part, frac_part) = compact.split_at(last);
        format!("{}{frac_part}", int_part.replace('.', ""))
    } else if !compact.contains('.') && compact.matches(',').count() == 1 {
        compact.replace(',', ".")
    } else {
        compact
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Column of a table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Frame,
    Coordinate(MarkerId, usize),
    Ignored,
}

fn parse_column(name: &str) -> Column {
    let name = name.trim();
    if name.eq_ignore_ascii_case("frame") {
        return Column::Frame;
    }
    let Some((marker, axis)) = name.split_once('_') else {
        return Column::Ignored;
    };
    match (
        marker.trim_start_matches('*').parse::<u32>(),
        AXES.iter().position(|a| axis.eq_ignore_ascii_case(a)),
    ) {
        (Ok(id), Some(axis)) => Column::Coordinate(MarkerId(id), axis),
        _ => Column::Ignored,
    }
}

/// Marker column layout resolved from a header.
#[derive(Debug, Clone, Default)]
struct ColumnMap {
    frame: Option<usize>,
    markers: BTreeMap<MarkerId, [Option<usize>; 3]>,
}

impl ColumnMap {
    fn from_columns(columns: impl IntoIterator<Item = Column>) -> Self {
        let mut map = Self::default();
        for (index, column) in columns.into_iter().enumerate() {
            match column {
                Column::Frame => map.frame = map.frame.or(Some(index)),
                Column::Coordinate(id, axis) => {
                    map.markers.entry(id).or_default()[axis] = Some(index);
                }
                Column::Ignored => {}
            }
        }
        map
    }

    /// Complete marker columns, or an error naming the first incomplete one.
    fn resolve(self) -> Result<(Option<usize>, Vec<(MarkerId, [usize; 3])>)> {
        if self.markers.is_empty() {
            return Err(ProcessingError::malformed_header("no marker coordinate columns"));
        }
        let markers = self
            .markers
            .into_iter()
            .map(|(id, axes)| match axes {
                [Some(x), Some(y), Some(z)] => Ok((id, [x, y, z])),
                _ => Err(ProcessingError::malformed_header(format!(
                    "marker {id} lacks one of its X/Y/Z columns"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((self.frame, markers))
    }
}

fn field(record: &ByteRecord, index: usize) -> String {
    record
        .get(index)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

fn record_line(record: &ByteRecord) -> usize {
    record
        .position()
        .and_then(|p| usize::try_from(p.line()).ok())
        .unwrap_or_default()
}

fn is_blank(record: &ByteRecord) -> bool {
    record.iter().all(|f| f.iter().all(u8::is_ascii_whitespace))
}

/// Collect frame rows into a recording.
fn build_recording(
    rows: impl Iterator<Item = csv::Result<ByteRecord>>,
    frame_column: Option<usize>,
    markers: &[(MarkerId, [usize; 3])],
    key: RecordingKey,
    sample_rate: f64,
) -> Result<Recording> {
    let mut positions: Vec<Vec<Option<[f64; 3]>>> = vec![Vec::new(); markers.len()];
    for row in rows {
        let row = row?;
        if is_blank(&row) {
            continue;
        }
        if let Some(frame) = frame_column {
            let value = field(&row, frame);
            if !value.trim().is_empty() && parse_value(&value).is_none() {
                return Err(ProcessingError::parse(
                    record_line(&row),
                    format!("frame number {value:?} is not numeric"),
                ));
            }
        }
        for (slot, (_, columns)) in positions.iter_mut().zip(markers) {
            let coords = columns.map(|c| parse_value(&field(&row, c)));
            slot.push(match coords {
                [Some(x), Some(y), Some(z)] => Some([x, y, z]),
                _ => None,
            });
        }
    }

    Recording::new(
        key,
        sample_rate,
        markers
            .iter()
            .zip(positions)
            .map(|((id, _), p)| MarkerTrajectory::from_positions(*id, &p)),
    )
}

/// Single-header-row table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvFormat {
    delimiter: u8,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self { delimiter: b';' }
    }
}

impl CsvFormat {
    /// Format with a custom delimiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the delimiter is not ASCII.
    pub fn new(delimiter: char) -> Result<Self> {
        Ok(Self {
            delimiter: delimiter_byte(delimiter)?,
        })
    }

    /// Format from the `io` section of a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the delimiter is not ASCII.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.io.delimiter)
    }

    fn writer<'w>(&self, sink: &'w mut dyn Write) -> csv::Writer<&'w mut dyn Write> {
        WriterBuilder::new().delimiter(self.delimiter).from_writer(sink)
    }
}

impl RecordingReader for CsvFormat {
    fn read_from(&self, source: &mut dyn Read, key: RecordingKey, sample_rate: f64) -> Result<Recording> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(source);

        let header = reader.byte_headers()?.clone();
        let columns = (0..header.len()).map(|i| parse_column(&field(&header, i)));
        let (frame, markers) = ColumnMap::from_columns(columns).resolve()?;
        build_recording(reader.byte_records(), frame, &markers, key, sample_rate)
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl RecordingWriter for CsvFormat {
    fn write_to(&self, recording: &Recording, sink: &mut dyn Write) -> Result<()> {
        let mut writer = self.writer(sink);

        let mut header = vec!["Frame".to_string()];
        for id in recording.marker_ids() {
            header.extend(AXES.iter().map(|axis| format!("{id}_{axis}")));
        }
        writer.write_record(&header)?;

        let mut row = Vec::with_capacity(header.len());
        for frame in 0..recording.frame_count() {
            row.clear();
            row.push(frame.to_string());
            for trajectory in recording.trajectories() {
                let position = trajectory.position(frame);
                row.extend((0..3).map(|axis| format_value(position.map(|p| p[axis]))));
            }
            writer.write_record(&row)?;
        }
        writer.flush().map_err(|e| ProcessingError::io("<csv sink>", e))
    }

    fn write_averaged_to(
        &self,
        averaged: &AveragedRecording,
        include_spread: bool,
        sink: &mut dyn Write,
    ) -> Result<()> {
        let mut writer = self.writer(sink);

        let mut header = vec!["Frame".to_string()];
        for id in averaged.marker_ids() {
            header.extend(AXES.iter().map(|axis| format!("{id}_{axis}")));
            header.push(format!("{id}_N"));
            if include_spread {
                header.extend(AXES.iter().map(|axis| format!("{id}_SD_{axis}")));
            }
        }
        writer.write_record(&header)?;

        let mut row = Vec::with_capacity(header.len());
        for frame in 0..averaged.frame_count() {
            row.clear();
            row.push(frame.to_string());
            for trajectory in averaged.trajectories() {
                let sample = trajectory
                    .samples()
                    .get(frame)
                    .copied()
                    .unwrap_or(AggregateSample::EMPTY);
                row.extend((0..3).map(|axis| format_value(sample.mean.map(|m| m[axis]))));
                row.push(sample.count.to_string());
                if include_spread {
                    row.extend((0..3).map(|axis| format_value(sample.spread.map(|s| s[axis]))));
                }
            }
            writer.write_record(&row)?;
        }
        writer.flush().map_err(|e| ProcessingError::io("<csv sink>", e))
    }
}

/// The capture system's export layout.
///
/// Metadata rows precede the trajectory block. The first row holding a
/// `*<id>` cell labels markers; each label applies to the columns up to the
/// next label. The row after it names the coordinate of every column, with
/// `Field #` marking the frame column. Frame rows follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureExportFormat {
    delimiter: u8,
}

impl Default for CaptureExportFormat {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CaptureExportFormat {
    /// Format with a custom delimiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the delimiter is not ASCII.
    pub fn new(delimiter: char) -> Result<Self> {
        Ok(Self {
            delimiter: delimiter_byte(delimiter)?,
        })
    }
}

fn marker_label(cell: &str) -> Option<MarkerId> {
    let digits: String = cell
        .trim()
        .strip_prefix('*')?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().map(MarkerId)
}

impl RecordingReader for CaptureExportFormat {
    fn read_from(&self, source: &mut dyn Read, key: RecordingKey, sample_rate: f64) -> Result<Recording> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(source);
        let mut records = reader.byte_records();

        let marker_row = loop {
            match records.next() {
                Some(row) => {
                    let row = row?;
                    if (0..row.len()).any(|i| marker_label(&field(&row, i)).is_some()) {
                        break row;
                    }
                }
                None => return Err(ProcessingError::malformed_header("no marker label row")),
            }
        };
        let coord_row = records
            .next()
            .ok_or_else(|| ProcessingError::malformed_header("missing coordinate row"))??;

        let mut current = None;
        let width = marker_row.len().max(coord_row.len());
        let columns: Vec<Column> = (0..width)
            .map(|i| {
                if let Some(id) = marker_label(&field(&marker_row, i)) {
                    current = Some(id);
                }
                let coord = field(&coord_row, i);
                let coord = coord.trim();
                if coord.to_lowercase().starts_with("field") {
                    return Column::Frame;
                }
                match (current, AXES.iter().position(|a| coord.eq_ignore_ascii_case(a))) {
                    (Some(id), Some(axis)) => Column::Coordinate(id, axis),
                    _ => Column::Ignored,
                }
            })
            .collect();

        let (frame, markers) = ColumnMap::from_columns(columns).resolve()?;
        build_recording(records, frame, &markers, key, sample_rate)
    }
}

/// Reader for the configured input layout.
///
/// # Errors
///
/// Returns an error if the configured delimiter is not ASCII.
pub fn reader_for(config: &PipelineConfig) -> Result<Box<dyn RecordingReader>> {
    Ok(match config.io.input_format {
        InputFormat::Table => Box::new(CsvFormat::new(config.io.delimiter)?),
        InputFormat::CaptureExport => Box::new(CaptureExportFormat::new(config.io.delimiter)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::average::average_trials;
    use crate::recording::Provenance;

    fn key() -> RecordingKey {
        RecordingKey::new("1", "greifen", "1")
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("1.5"), Some(1.5));
        assert_eq!(parse_value(" 12 3.5 "), Some(123.5));
        assert_eq!(parse_value("127.228.226"), Some(127_228.226));
        assert_eq!(parse_value("-4,25"), Some(-4.25));
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("abc"), None);
    }

    #[test]
    fn test_parse_column() {
        assert_eq!(parse_column("Frame"), Column::Frame);
        assert_eq!(parse_column("12_y"), Column::Coordinate(MarkerId(12), 1));
        assert_eq!(parse_column("1_N"), Column::Ignored);
        assert_eq!(parse_column("1_SD_X"), Column::Ignored);
        assert_eq!(parse_column("Time"), Column::Ignored);
    }

    #[test]
    fn test_read_table() {
        let data = "Frame;2_X;2_Y;2_Z;1_X;1_Y;1_Z;Notes\n\
                    0;1;2;3;4;5;6;x\n\
                    1;;2;3;4.5;5;6;\n\
                    2;1;2;NaN;4;5;6\n";
        let rec = CsvFormat::default()
            .read_from(&mut data.as_bytes(), key(), 200.0)
            .unwrap();
        assert_eq!(rec.frame_count(), 3);
        assert_eq!(rec.marker_ids().collect::<Vec<_>>(), vec![MarkerId(1), MarkerId(2)]);

        let m2 = rec.marker(MarkerId(2)).unwrap();
        assert_eq!(m2.position(0), Some([1.0, 2.0, 3.0]));
        assert_eq!(m2.position(1), None);
        assert_eq!(m2.position(2), None);
        assert_eq!(rec.marker(MarkerId(1)).unwrap().position(1), Some([4.5, 5.0, 6.0]));
    }

    #[test]
    fn test_malformed_headers() {
        let format = CsvFormat::default();
        let err = format
            .read_from(&mut "Frame;Time\n0;1\n".as_bytes(), key(), 200.0)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedHeader(_)));

        let err = format
            .read_from(&mut "Frame;1_X;1_Y\n0;1;2\n".as_bytes(), key(), 200.0)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedHeader(_)));
    }

    #[test]
    fn test_bad_frame_number() {
        let err = CsvFormat::default()
            .read_from(&mut "Frame;1_X;1_Y;1_Z\n0;1;2;3\nend;1;2;3\n".as_bytes(), key(), 200.0)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_write_then_read_keeps_missing() {
        let rec = Recording::new(
            key(),
            200.0,
            [MarkerTrajectory::from_positions(
                MarkerId(3),
                &[Some([1.25, -2.0, 1e-3]), None],
            )],
        )
        .unwrap();
        let mut buf = Vec::new();
        CsvFormat::default().write_to(&rec, &mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(text, "Frame;3_X;3_Y;3_Z\n0;1.25;-2;0.001\n1;;;\n");

        let back = CsvFormat::default()
            .read_from(&mut buf.as_slice(), key(), 200.0)
            .unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_write_averaged_columns() {
        let a = Recording::new(key(), 200.0, [MarkerTrajectory::from_points(MarkerId(1), &[[0.0; 3]])]).unwrap();
        let b = Recording::new(
            RecordingKey::new("1", "greifen", "2"),
            200.0,
            [MarkerTrajectory::from_points(MarkerId(1), &[[2.0; 3], [4.0; 3]])],
        )
        .unwrap();
        let avg = average_trials(&[&a, &b], &PipelineConfig::default()).unwrap();

        let mut buf = Vec::new();
        CsvFormat::default().write_averaged_to(&avg, true, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Frame;1_X;1_Y;1_Z;1_N;1_SD_X;1_SD_Y;1_SD_Z");
        assert!(lines[1].starts_with("0;1;1;1;2;"));
        assert_eq!(lines[2], "1;4;4;4;1;;;");

        let mut buf = Vec::new();
        CsvFormat::default().write_averaged_to(&avg, false, &mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("Frame;1_X;1_Y;1_Z;1_N\n"));
    }

    #[test]
    fn test_capture_export() {
        let data = "TRAJECTORIES\n\
                    Frame Rate,200\n\
                    ,*1,,,*7,,\n\
                    Field #,X,Y,Z,X,Y,Z\n\
                    \n\
                    1,1.0,2.0,3.0,,,\n\
                    2,\"1.001.5\",2.0,3.0,7,8,9\n";
        let rec = CaptureExportFormat::default()
            .read_from(&mut data.as_bytes(), key(), 200.0)
            .unwrap();
        assert_eq!(rec.frame_count(), 2);
        assert_eq!(rec.marker(MarkerId(1)).unwrap().position(1), Some([1001.5, 2.0, 3.0]));
        let aux = rec.marker(MarkerId(7)).unwrap();
        assert_eq!(aux.position(0), None);
        assert_eq!(aux.samples()[1].provenance(), Provenance::Original);
    }

    #[test]
    fn test_capture_export_without_labels() {
        let err = CaptureExportFormat::default()
            .read_from(&mut "a,b\n1,2\n".as_bytes(), key(), 200.0)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedHeader(_)));
    }
}
