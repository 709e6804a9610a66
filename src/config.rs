//! Configuration for the reconstruction pipeline.
//!
//! [`PipelineConfig`] centralizes every tunable threshold so each component
//! receives its parameters explicitly. Defaults reproduce the values used for
//! the source recordings (200 Hz capture, millimetre coordinates).
//!
//! # Example
//!
//! ```
//! use mocap_reduce::PipelineConfig;
//!
//! let config = PipelineConfig::default()
//!     .with_max_gap_span(30)
//!     .with_smoothing(9, 3);
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};
use crate::recording::MarkerId;

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reference selection for anchor markers.
    pub reference: ReferenceConfig,
    /// Gap interpolation.
    pub interpolation: InterpolationConfig,
    /// Idle-motion trimming.
    pub trim: TrimConfig,
    /// Trial averaging.
    pub averaging: AveragingConfig,
    /// Final smoothing.
    pub smoothing: SmoothingConfig,
    /// Recording file format.
    pub io: IoConfig,
    /// Base-marker roster per experiment.
    pub roster: RosterConfig,
}

/// Reference selection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Markers that receive reference-anchored boundary extrapolation.
    pub anchor_markers: Vec<MarkerId>,

    /// Score divisor per gap run: `valid_fraction / (1 + penalty * runs)`.
    pub fragmentation_penalty: f64,

    /// Abort the run when an experiment has anchor markers but none resolves.
    pub require_references: bool,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            anchor_markers: vec![MarkerId(4), MarkerId(5)],
            fragmentation_penalty: 0.1,
            require_references: true,
        }
    }
}

/// Gap interpolation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// Longest internal gap (frames) that is interpolated.
    pub max_gap_span: usize,

    /// Extra valid neighbours used on each side of an internal gap.
    pub neighbor_window: usize,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            max_gap_span: 50,
            neighbor_window: 3,
        }
    }
}

/// How per-marker step lengths collapse into one per-frame displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityAggregation {
    /// Mean Euclidean step length across markers.
    #[default]
    Mean,
    /// Euclidean norm of the concatenated step vector of all markers.
    Norm,
}

/// Idle-motion trimming parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Displacement per frame (coordinate units) that counts as motion.
    pub velocity_threshold: f64,

    /// Rolling window length in frames.
    pub window_frames: usize,

    /// Marker aggregation policy.
    pub aggregation: VelocityAggregation,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 3.0,
            window_frames: 60,
            aggregation: VelocityAggregation::Mean,
        }
    }
}

/// Averaging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingConfig {
    /// Compute per-frame sample standard deviation alongside the mean.
    pub include_spread: bool,
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self {
            include_spread: true,
        }
    }
}

/// Savitzky–Golay parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Odd window length in frames.
    pub window_length: usize,

    /// Polynomial order, strictly less than `window_length`.
    pub poly_order: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_length: 11,
            poly_order: 2,
        }
    }
}

/// Layout of input recording files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// One header row: `Frame;1_X;1_Y;1_Z;...`.
    #[default]
    Table,
    /// Capture-system export with `*<id>` marker and `X/Y/Z` coordinate rows.
    CaptureExport,
}

/// Recording file parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Field delimiter.
    pub delimiter: char,

    /// Capture rate assigned to files read from disk (frames/second).
    pub sample_rate: f64,

    /// Layout of the input files.
    pub input_format: InputFormat,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            delimiter: ';',
            sample_rate: 200.0,
            input_format: InputFormat::Table,
        }
    }
}

/// Keyword rule mapping experiment names to a base-marker roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRule {
    /// Case-insensitive substrings of the experiment id.
    pub keywords: Vec<String>,
    /// Base markers kept for matching experiments.
    pub markers: Vec<MarkerId>,
}

/// Base-marker roster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Roster for experiments no rule matches.
    pub default_markers: Vec<MarkerId>,

    /// Fill base-marker gaps from auxiliary markers before interpolation.
    pub substitute_auxiliary: bool,

    /// Rules tried in order; first match wins.
    pub rules: Vec<RosterRule>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        let markers = |ids: &[u32]| -> Vec<MarkerId> { ids.iter().copied().map(MarkerId).collect() };
        let words = |ws: &[&str]| -> Vec<String> { ws.iter().map(|w| (*w).to_string()).collect() };
        Self {
            default_markers: markers(&[1]),
            substitute_auxiliary: true,
            rules: vec![
                RosterRule {
                    keywords: words(&["gewicht", "greifen", "präzision"]),
                    markers: markers(&[1, 2, 3, 4, 5]),
                },
                RosterRule {
                    keywords: words(&["ptp", "sequentiell", "zickzack", "kreis"]),
                    markers: markers(&[1]),
                },
            ],
        }
    }
}

impl RosterConfig {
    /// Base markers for an experiment, and whether a rule matched.
    #[must_use]
    pub fn base_markers(&self, experiment: &str) -> (&[MarkerId], bool) {
        let lower = experiment.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| lower.contains(&k.to_lowercase())))
            .map_or((self.default_markers.as_slice(), false), |rule| {
                (rule.markers.as_slice(), true)
            })
    }
}

impl PipelineConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if !(self.reference.fragmentation_penalty >= 0.0) {
            return Err(ProcessingError::invalid_config(
                "fragmentation_penalty must be non-negative",
            ));
        }
        if self.interpolation.max_gap_span == 0 {
            return Err(ProcessingError::invalid_config(
                "max_gap_span must be at least 1",
            ));
        }
        if !(self.trim.velocity_threshold >= 0.0) {
            return Err(ProcessingError::invalid_config(
                "velocity_threshold must be non-negative",
            ));
        }
        if self.trim.window_frames == 0 {
            return Err(ProcessingError::invalid_config(
                "window_frames must be at least 1",
            ));
        }
        if self.smoothing.window_length % 2 == 0 {
            return Err(ProcessingError::invalid_config(format!(
                "window_length must be odd, got {}",
                self.smoothing.window_length
            )));
        }
        if self.smoothing.poly_order >= self.smoothing.window_length {
            return Err(ProcessingError::invalid_config(format!(
                "poly_order {} must be less than window_length {}",
                self.smoothing.poly_order, self.smoothing.window_length
            )));
        }
        if !(self.io.sample_rate.is_finite() && self.io.sample_rate > 0.0) {
            return Err(ProcessingError::invalid_config("sample_rate must be positive"));
        }
        if !self.io.delimiter.is_ascii() {
            return Err(ProcessingError::invalid_config("delimiter must be ASCII"));
        }
        Ok(())
    }

    /// Values matching the source processing scripts.
    #[must_use]
    pub fn source_defaults() -> Self {
        Self {
            trim: TrimConfig {
                aggregation: VelocityAggregation::Norm,
                ..TrimConfig::default()
            },
            ..Self::default()
        }
    }

    /// Preset that synthesises less data: shorter interpolated gaps and a
    /// longer motion window.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            interpolation: InterpolationConfig {
                max_gap_span: 10,
                ..InterpolationConfig::default()
            },
            trim: TrimConfig {
                window_frames: 100,
                ..TrimConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the longest interpolated internal gap.
    #[must_use]
    pub const fn with_max_gap_span(mut self, frames: usize) -> Self {
        self.interpolation.max_gap_span = frames;
        self
    }

    /// Set the anchor markers.
    #[must_use]
    pub fn with_anchor_markers(mut self, markers: impl IntoIterator<Item = MarkerId>) -> Self {
        self.reference.anchor_markers = markers.into_iter().collect();
        self
    }

    /// Set the motion threshold and rolling window.
    #[must_use]
    pub const fn with_trim(mut self, velocity_threshold: f64, window_frames: usize) -> Self {
        self.trim.velocity_threshold = velocity_threshold;
        self.trim.window_frames = window_frames;
        self
    }

    /// Set the smoothing window and polynomial order.
    #[must_use]
    pub const fn with_smoothing(mut self, window_length: usize, poly_order: usize) -> Self {
        self.smoothing.window_length = window_length;
        self.smoothing.poly_order = poly_order;
        self
    }

    /// Set the capture rate used for files.
    #[must_use]
    pub const fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.io.sample_rate = sample_rate;
        self
    }

    /// Whether `marker` is configured as an anchor.
    #[must_use]
    pub fn is_anchor(&self, marker: MarkerId) -> bool {
        self.reference.anchor_markers.contains(&marker)
    }

    /// Load and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ProcessingError::io(path, e))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ProcessingError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProcessingError::io(parent, e))?;
        }
        std::fs::write(path, content).map_err(|e| ProcessingError::io(path, e))
    }

    /// TOML representation.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProcessingError::invalid_config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interpolation.max_gap_span, 50);
        assert_eq!(config.smoothing.window_length, 11);
        assert!(config.is_anchor(MarkerId(4)));
        assert!(!config.is_anchor(MarkerId(1)));
    }

    #[test]
    fn test_presets() {
        assert!(PipelineConfig::source_defaults().validate().is_ok());
        assert_eq!(
            PipelineConfig::source_defaults().trim.aggregation,
            VelocityAggregation::Norm
        );
        let strict = PipelineConfig::strict();
        assert!(strict.validate().is_ok());
        assert_eq!(strict.interpolation.max_gap_span, 10);
    }

    #[test]
    fn test_validation() {
        assert!(PipelineConfig::default().with_smoothing(10, 2).validate().is_err());
        assert!(PipelineConfig::default().with_smoothing(5, 5).validate().is_err());
        assert!(PipelineConfig::default().with_smoothing(1, 0).validate().is_ok());
        assert!(PipelineConfig::default().with_max_gap_span(0).validate().is_err());
        assert!(PipelineConfig::default().with_trim(3.0, 0).validate().is_err());
        assert!(PipelineConfig::default().with_sample_rate(0.0).validate().is_err());

        let mut config = PipelineConfig::default();
        config.reference.fragmentation_penalty = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roster_rules() {
        let roster = RosterConfig::default();
        let (markers, matched) = roster.base_markers("Greifen_links");
        assert!(matched);
        assert_eq!(markers.len(), 5);

        let (markers, matched) = roster.base_markers("PTP2");
        assert!(matched);
        assert_eq!(markers, &[MarkerId(1)]);

        let (markers, matched) = roster.base_markers("unknown");
        assert!(!matched);
        assert_eq!(markers, &[MarkerId(1)]);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = PipelineConfig::strict().with_anchor_markers([MarkerId(2)]);
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str("[trim]\nwindow_frames = 20\n").unwrap();
        assert_eq!(config.trim.window_frames, 20);
        assert_eq!(config.trim.velocity_threshold, 3.0);
        assert_eq!(config.smoothing, SmoothingConfig::default());
    }
}
