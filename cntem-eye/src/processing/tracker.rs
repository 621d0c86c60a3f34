//! Identity tracking across frames
//!
//! Matches each frame's detections against live identities (IoU first, then
//! nearest centroid), ages out identities that stay unmatched, and confirms an
//! identity exactly once after enough consecutive observations. Confirmation
//! is the only thing that moves the count.

use cntem_core::{BoundingBox, CounterConfig, Detection};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};

/// Matching and lifecycle thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    /// Minimum IoU for the overlap pass to bind a detection
    pub iou_threshold: f32,
    /// Identities missed for more frames than this are evicted
    pub max_missed_frames: u32,
    /// Consecutive observations needed before an identity is counted
    pub min_frames_to_count: u32,
    /// Maximum centroid distance (px) for the fallback pass
    pub max_centroid_dist: f32,
    /// Only let the fallback pass bind detections of the identity's own class
    pub restrict_fallback_to_same_class: bool,
}

impl TrackerSettings {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            max_missed_frames: config.max_missed_frames,
            min_frames_to_count: config.min_frames_to_count,
            max_centroid_dist: config.max_centroid_dist,
            restrict_fallback_to_same_class: config.restrict_fallback_to_same_class,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&CounterConfig::default())
    }
}

/// Lifecycle of a live identity. Lost identities are evicted, so they never
/// appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackState {
    Provisional,
    Confirmed,
}

/// An object followed across frames
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedIdentity {
    pub id: u64,
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub consecutive_observed_frames: u32,
    pub missed_frames: u32,
    pub counted: bool,
}

impl TrackedIdentity {
    fn spawn(id: u64, detection: &Detection) -> Self {
        Self {
            id,
            bbox: detection.bbox,
            class_id: detection.class_id,
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            consecutive_observed_frames: 1,
            missed_frames: 0,
            counted: false,
        }
    }

    fn observe(&mut self, detection: &Detection) {
        self.bbox = detection.bbox;
        self.class_id = detection.class_id;
        self.class_name.clone_from(&detection.class_name);
        self.confidence = detection.confidence;
        self.consecutive_observed_frames = self.consecutive_observed_frames.saturating_add(1);
        self.missed_frames = 0;
    }

    pub fn state(&self) -> TrackState {
        if self.counted {
            TrackState::Confirmed
        } else {
            TrackState::Provisional
        }
    }

    /// Matched in the most recent frame
    pub fn is_visible(&self) -> bool {
        self.missed_frames == 0
    }
}

/// Result of feeding one frame to the tracker
#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    /// Identities confirmed on this frame
    pub newly_counted: u32,
    /// Ids of the identities confirmed on this frame, ascending
    pub confirmed: Vec<u64>,
    /// Live identities after the update, ascending by id
    pub tracks: Vec<TrackedIdentity>,
    /// Ids removed on this frame
    pub evicted: Vec<u64>,
}

/// Owns the live identity set. Not shared: all mutation happens through
/// `&mut self` on the task driving the pipeline.
#[derive(Debug)]
pub struct IdentityTracker {
    settings: TrackerSettings,
    identities: BTreeMap<u64, TrackedIdentity>,
    next_id: u64,
}

impl IdentityTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            identities: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn from_config(config: &CounterConfig) -> Self {
        Self::new(TrackerSettings::from_config(config))
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Feed one frame's zone-filtered detections
    pub fn update(&mut self, detections: &[Detection]) -> TrackerUpdate {
        let mut used = vec![false; detections.len()];
        let mut matched = BTreeSet::new();

        // Overlap pass
        for (id, identity) in self.identities.iter_mut() {
            let mut best: Option<(usize, f32)> = None;
            for (idx, detection) in detections.iter().enumerate() {
                if used[idx] {
                    continue;
                }
                let iou = identity.bbox.iou(&detection.bbox);
                if iou > best.map_or(0.0, |(_, b)| b) {
                    best = Some((idx, iou));
                }
            }

            if let Some((idx, iou)) = best {
                if iou >= self.settings.iou_threshold {
                    trace!("Identity {} matched by IoU {:.3}", id, iou);
                    identity.observe(&detections[idx]);
                    used[idx] = true;
                    matched.insert(*id);
                }
            }
        }

        // Centroid fallback pass
        for (id, identity) in self.identities.iter_mut() {
            if matched.contains(id) {
                continue;
            }

            let center = identity.bbox.centroid();
            let mut best: Option<(usize, f32)> = None;
            for (idx, detection) in detections.iter().enumerate() {
                if used[idx] {
                    continue;
                }
                if self.settings.restrict_fallback_to_same_class && detection.class_id != identity.class_id {
                    continue;
                }
                let dist = center.distance(&detection.bbox.centroid());
                if best.map_or(true, |(_, b)| dist < b) {
                    best = Some((idx, dist));
                }
            }

            if let Some((idx, dist)) = best {
                if dist <= self.settings.max_centroid_dist {
                    let detection = &detections[idx];
                    if detection.class_id != identity.class_id {
                        debug!(
                            "Identity {} bridged from {} to {} by centroid distance {:.1}",
                            id, identity.class_name, detection.class_name, dist
                        );
                    } else {
                        trace!("Identity {} matched by centroid distance {:.1}", id, dist);
                    }
                    identity.observe(detection);
                    used[idx] = true;
                    matched.insert(*id);
                }
            }
        }

        for (id, identity) in self.identities.iter_mut() {
            if !matched.contains(id) {
                identity.missed_frames = identity.missed_frames.saturating_add(1);
            }
        }

        let max_missed = self.settings.max_missed_frames;
        let evicted: Vec<u64> = self
            .identities
            .values()
            .filter(|identity| identity.missed_frames > max_missed)
            .map(|identity| identity.id)
            .collect();
        for id in &evicted {
            self.identities.remove(id);
            debug!("Identity {} lost after {} missed frames", id, max_missed + 1);
        }

        for (idx, detection) in detections.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.identities.insert(id, TrackedIdentity::spawn(id, detection));
            debug!("New {} identity {} at {:?}", detection.class_name, id, detection.bbox);
        }

        let mut confirmed = Vec::new();
        for identity in self.identities.values_mut() {
            if !identity.counted && identity.consecutive_observed_frames >= self.settings.min_frames_to_count {
                identity.counted = true;
                confirmed.push(identity.id);
                info!(
                    "Counted {} (identity {}, confidence {:.2})",
                    identity.class_name, identity.id, identity.confidence
                );
            }
        }

        TrackerUpdate {
            newly_counted: confirmed.len() as u32,
            confirmed,
            tracks: self.identities.values().cloned().collect(),
            evicted,
        }
    }

    /// Drop every identity and restart ids at 1
    pub fn reset(&mut self) {
        self.identities.clear();
        self.next_id = 1;
        debug!("Tracker reset");
    }

    /// Counted identities matched in the latest frame
    pub fn visible_counted(&self) -> usize {
        self.identities
            .values()
            .filter(|identity| identity.counted && identity.is_visible())
            .count()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackedIdentity> {
        self.identities.values()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedIdentity> {
        self.identities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}
