//! Detector-free tripwire: counts sustained pixel change along a horizontal line
//!
//! Cooldown and flash windows are measured on frame timestamps, so the sensor
//! is fully deterministic for a given frame sequence.

use cntem_core::{CounterConfig, Frame};
use image::{GrayImage, Luma};
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripwireSettings {
    /// Line position as a fraction of frame height
    pub line_y: f32,
    /// Fraction of strip pixels that must change to fire
    pub change_threshold: f32,
    pub cooldown: Duration,
    pub flash: Duration,
    /// Strip height in source pixels, centered on the line
    pub strip_height: u32,
    /// Per-pixel intensity change that counts as "changed"
    pub pixel_delta: u8,
    /// Minimum frame-clock spacing between samples
    pub sample_interval: Duration,
}

impl TripwireSettings {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            line_y: config.tripwire_y,
            change_threshold: config.tripwire_change_threshold,
            cooldown: config.tripwire_cooldown(),
            flash: config.tripwire_flash(),
            strip_height: config.tripwire_strip_height,
            pixel_delta: config.tripwire_pixel_delta,
            sample_interval: config.tripwire_interval(),
        }
    }
}

impl Default for TripwireSettings {
    fn default() -> Self {
        Self::from_config(&CounterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripwireState {
    /// Not sampling
    Idle,
    /// Sampling, ready to fire
    Armed,
    /// Fired recently; crossings ignored until the cooldown ends
    Triggered,
}

/// What one sampled frame produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripwireObservation {
    /// None on the first sample after (re)start
    pub change_fraction: Option<f32>,
    pub triggered: bool,
    pub flashing: bool,
}

#[derive(Debug)]
pub struct TripwireSensor {
    settings: TripwireSettings,
    running: bool,
    previous: Option<GrayImage>,
    last_sample: Option<Duration>,
    cooldown_until: Option<Duration>,
    flash_until: Option<Duration>,
    triggers: u64,
}

impl TripwireSensor {
    pub fn new(settings: TripwireSettings) -> Self {
        Self {
            settings,
            running: false,
            previous: None,
            last_sample: None,
            cooldown_until: None,
            flash_until: None,
            triggers: 0,
        }
    }

    pub fn from_config(config: &CounterConfig) -> Self {
        Self::new(TripwireSettings::from_config(config))
    }

    pub fn settings(&self) -> &TripwireSettings {
        &self.settings
    }

    /// Arm the sensor. The next sample only establishes a baseline.
    pub fn start(&mut self) {
        self.clear();
        self.running = true;
        debug!("Tripwire armed at y={:.2}", self.settings.line_y);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.clear();
        debug!("Tripwire stopped");
    }

    /// Forget the previous strip and any pending cooldown
    pub fn reset(&mut self) {
        self.clear();
        self.triggers = 0;
    }

    fn clear(&mut self) {
        self.previous = None;
        self.last_sample = None;
        self.cooldown_until = None;
        self.flash_until = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Crossings counted since the last reset
    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    pub fn state(&self, at: Duration) -> TripwireState {
        if !self.running {
            TripwireState::Idle
        } else if self.in_cooldown(at) {
            TripwireState::Triggered
        } else {
            TripwireState::Armed
        }
    }

    pub fn in_cooldown(&self, at: Duration) -> bool {
        self.cooldown_until.map_or(false, |until| at < until)
    }

    pub fn is_flashing(&self, at: Duration) -> bool {
        self.flash_until.map_or(false, |until| at < until)
    }

    /// Sample one frame. Returns None while idle or when the frame arrives
    /// sooner than the sample interval allows.
    pub fn process(&mut self, frame: &Frame) -> Option<TripwireObservation> {
        if !self.running {
            return None;
        }

        let now = frame.timestamp;
        if let Some(last) = self.last_sample {
            match now.checked_sub(last) {
                Some(elapsed) if elapsed < self.settings.sample_interval => return None,
                Some(_) => {}
                None => {
                    // deadlines from the old clock mean nothing on the new one
                    debug!("Frame {}: clock went backwards, dropping cooldown", frame.sequence);
                    self.cooldown_until = None;
                    self.flash_until = None;
                }
            }
        }
        self.last_sample = Some(now);

        let strip = extract_strip(frame, self.settings.line_y, self.settings.strip_height);
        let mut change = None;
        let mut triggered = false;

        if let (Some(previous), Some(current)) = (&self.previous, &strip) {
            let fraction = change_fraction(previous, current, self.settings.pixel_delta);
            trace!("Frame {}: tripwire change {:.3}", frame.sequence, fraction);
            change = Some(fraction);

            if fraction >= self.settings.change_threshold && !self.in_cooldown(now) {
                triggered = true;
                self.triggers += 1;
                self.cooldown_until = Some(now + self.settings.cooldown);
                self.flash_until = Some(now + self.settings.flash);
                info!(
                    "Tripwire crossing #{} on frame {} (change {:.2})",
                    self.triggers, frame.sequence, fraction
                );
            }
        }

        self.previous = strip;

        Some(TripwireObservation {
            change_fraction: change,
            triggered,
            flashing: self.is_flashing(now),
        })
    }
}

impl Default for TripwireSensor {
    fn default() -> Self {
        Self::new(TripwireSettings::default())
    }
}

/// Grayscale band of `strip_height` rows centered on `line_y`, clamped to the
/// frame. None for an empty frame.
pub fn extract_strip(frame: &Frame, line_y: f32, strip_height: u32) -> Option<GrayImage> {
    if frame.is_empty() {
        return None;
    }

    let (width, height) = (frame.width(), frame.height());
    let line = (height as f32 * line_y.clamp(0.0, 1.0)).floor() as u32;
    let top = line.saturating_sub(strip_height / 2).min(height - 1);
    let rows = strip_height.max(1).min(height - top);

    let image = &*frame.image;
    Some(GrayImage::from_fn(width, rows, |x, y| {
        let [r, g, b] = image.get_pixel(x, top + y).0;
        let luma = r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114;
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    }))
}

/// Fraction of pixels whose intensity moved by more than `delta`.
/// Strips of different shape compare as unchanged.
pub fn change_fraction(previous: &GrayImage, current: &GrayImage, delta: u8) -> f32 {
    if previous.dimensions() != current.dimensions() {
        return 0.0;
    }

    let total = previous.as_raw().len();
    if total == 0 {
        return 0.0;
    }

    let changed = previous
        .as_raw()
        .iter()
        .zip(current.as_raw())
        .filter(|(a, b)| a.abs_diff(**b) > delta)
        .count();

    changed as f32 / total as f32
}
