// Session configuration for the counting pipeline

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Which evidence source drives the count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceMode {
    /// Bounding-box detector + zone gating + identity tracking
    Detector,
    /// Detector-free pixel-change tripwire
    Tripwire,
}

/// Document formats configuration can be read from and rendered to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

/// Zone gating insets, each a fraction of the frame size measured from its edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneInsets {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl ZoneInsets {
    pub fn uniform(inset: f32) -> Self {
        Self {
            left: inset,
            top: inset,
            right: inset,
            bottom: inset,
        }
    }
}

impl Default for ZoneInsets {
    fn default() -> Self {
        Self::uniform(0.2)
    }
}

/// Raw tensor decoding parameters for tensor-based detectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecoderConfig {
    /// Square inference resolution the source frame is letterboxed into
    pub input_size: u32,
    /// Global score floor applied to the argmax class
    pub confidence_threshold: f32,
    /// Overlap above which a lower-scored box is suppressed
    pub nms_iou_threshold: f32,
    /// Class names in model output order
    pub class_names: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.35,
            nms_iou_threshold: 0.45,
            class_names: vec!["bottle".to_string(), "can".to_string()],
        }
    }
}

/// Counting session configuration. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CounterConfig {
    pub mode: EvidenceMode,

    // Detection source
    pub target_classes: Vec<String>,
    pub display_names: HashMap<String, String>,
    pub confidence_thresholds: HashMap<String, f32>,
    pub default_confidence_threshold: f32,
    pub detection_fps: u32,
    pub detector_timeout_ms: u64,
    pub decoder: DecoderConfig,

    // Zone gating
    pub zone_inset_fractions: ZoneInsets,

    // Identity tracking
    pub iou_threshold: f32,
    pub max_missed_frames: u32,
    pub min_frames_to_count: u32,
    pub max_centroid_dist: f32,
    pub restrict_fallback_to_same_class: bool,

    // Tripwire
    pub tripwire_y: f32,
    pub tripwire_change_threshold: f32,
    pub tripwire_cooldown_ms: u64,
    pub tripwire_flash_ms: u64,
    pub tripwire_strip_height: u32,
    pub tripwire_pixel_delta: u8,
    pub tripwire_fps: u32,

    // Driver
    pub poll_interval_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        let mut confidence_thresholds = HashMap::new();
        confidence_thresholds.insert("bottle".to_string(), 0.35);
        // cups need a higher bar to keep false positives down
        confidence_thresholds.insert("cup".to_string(), 0.5);

        let mut display_names = HashMap::new();
        display_names.insert("bottle".to_string(), "bottle".to_string());
        display_names.insert("cup".to_string(), "can".to_string());

        Self {
            mode: EvidenceMode::Detector,
            target_classes: vec!["bottle".to_string(), "cup".to_string()],
            display_names,
            confidence_thresholds,
            default_confidence_threshold: 0.35,
            detection_fps: 15,
            detector_timeout_ms: 1000,
            decoder: DecoderConfig::default(),
            zone_inset_fractions: ZoneInsets::default(),
            iou_threshold: 0.3,
            max_missed_frames: 8,
            min_frames_to_count: 3,
            max_centroid_dist: 80.0,
            restrict_fallback_to_same_class: false,
            tripwire_y: 0.5,
            tripwire_change_threshold: 0.15,
            tripwire_cooldown_ms: 400,
            tripwire_flash_ms: 200,
            tripwire_strip_height: 30,
            tripwire_pixel_delta: 30,
            tripwire_fps: 20,
            poll_interval_ms: 10,
        }
    }
}

impl CounterConfig {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Load configuration from a JSON, TOML or YAML document
    pub fn from_str(content: &str) -> Result<Self> {
        if let Ok(config) = serde_json::from_str::<CounterConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<CounterConfig>(content) {
            return Ok(config);
        }

        serde_yaml::from_str::<CounterConfig>(content)
            .map_err(|e| Error::Deserialization(format!("Unrecognized configuration format: {}", e)))
    }

    /// Defaults with `CNTEM_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `CNTEM_*` environment overrides on top of the current values.
    /// A variable that is set but does not parse is rejected.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Apply overrides read through `lookup`, keyed by environment variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup("CNTEM_MODE") {
            self.mode = match mode.trim().to_ascii_lowercase().as_str() {
                "detector" => EvidenceMode::Detector,
                "tripwire" => EvidenceMode::Tripwire,
                _ => return Err(invalid_override("CNTEM_MODE", &mode)),
            };
        }

        if let Some(fps) = parse_override(&lookup, "CNTEM_DETECTION_FPS")? {
            self.detection_fps = fps;
        }

        if let Some(y) = parse_override(&lookup, "CNTEM_TRIPWIRE_Y")? {
            self.tripwire_y = y;
        }

        if let Some(cooldown) = parse_override(&lookup, "CNTEM_TRIPWIRE_COOLDOWN_MS")? {
            self.tripwire_cooldown_ms = cooldown;
        }

        Ok(())
    }

    /// Render in one of the supported document formats
    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string())),
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string())),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string())),
        }
    }

    /// Reject invalid configuration. Values are never clamped.
    pub fn validate(&self) -> Result<()> {
        if self.target_classes.is_empty() {
            return invalid("targetClasses must not be empty");
        }

        unit_interval("defaultConfidenceThreshold", self.default_confidence_threshold)?;
        for (class, threshold) in &self.confidence_thresholds {
            unit_interval(&format!("confidenceThresholds.{}", class), *threshold)?;
        }
        unit_interval("iouThreshold", self.iou_threshold)?;
        unit_interval("tripwireY", self.tripwire_y)?;
        unit_interval("tripwireChangeThreshold", self.tripwire_change_threshold)?;
        unit_interval("decoder.confidenceThreshold", self.decoder.confidence_threshold)?;
        unit_interval("decoder.nmsIouThreshold", self.decoder.nms_iou_threshold)?;

        if self.min_frames_to_count == 0 {
            return invalid("minFramesToCount must be at least 1");
        }

        if !self.max_centroid_dist.is_finite() || self.max_centroid_dist < 0.0 {
            return invalid("maxCentroidDist must be a finite, non-negative distance");
        }

        if self.detection_fps == 0 {
            return invalid("detectionFps must be at least 1");
        }

        if self.tripwire_fps == 0 {
            return invalid("tripwireFps must be at least 1");
        }

        if self.detector_timeout_ms == 0 {
            return invalid("detectorTimeoutMs must be at least 1");
        }

        if self.poll_interval_ms == 0 {
            return invalid("pollIntervalMs must be at least 1");
        }

        if self.tripwire_strip_height == 0 {
            return invalid("tripwireStripHeight must be at least 1");
        }

        let zone = &self.zone_inset_fractions;
        for (name, inset) in [
            ("left", zone.left),
            ("top", zone.top),
            ("right", zone.right),
            ("bottom", zone.bottom),
        ] {
            if !inset.is_finite() || !(0.0..1.0).contains(&inset) {
                return invalid(&format!("zoneInsetFractions.{} must be within [0, 1)", name));
            }
        }
        if zone.left + zone.right >= 1.0 || zone.top + zone.bottom >= 1.0 {
            return invalid("zoneInsetFractions leave an empty count zone");
        }

        if self.decoder.input_size < 32 {
            return invalid("decoder.inputSize must be at least 32");
        }

        if self.decoder.class_names.is_empty() {
            return invalid("decoder.classNames must not be empty");
        }

        Ok(())
    }

    /// Score a prediction of `class` must exceed to be kept
    pub fn confidence_threshold(&self, class: &str) -> f32 {
        self.confidence_thresholds
            .get(class)
            .copied()
            .unwrap_or(self.default_confidence_threshold)
    }

    /// User-facing label for a class, e.g. `cup` is shown as `can`
    pub fn display_name<'a>(&'a self, class: &'a str) -> &'a str {
        self.display_names.get(class).map(String::as_str).unwrap_or(class)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.detection_fps.max(1) as f64)
    }

    pub fn tripwire_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tripwire_fps.max(1) as f64)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn tripwire_cooldown(&self) -> Duration {
        Duration::from_millis(self.tripwire_cooldown_ms)
    }

    pub fn tripwire_flash(&self) -> Duration {
        Duration::from_millis(self.tripwire_flash_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_override<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid_override(key, &raw)),
        None => Ok(None),
    }
}

fn invalid_override(key: &str, raw: &str) -> Error {
    Error::ConfigurationInvalid(format!("{} has unrecognized value {:?}", key, raw))
}

fn invalid(message: &str) -> Result<()> {
    Err(Error::ConfigurationInvalid(message.to_string()))
}

fn unit_interval(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return invalid(&format!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}
