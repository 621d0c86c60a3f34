//! Per-frame counting stages

pub mod tracker;
pub mod tripwire;
pub mod zone;

pub use tracker::{IdentityTracker, TrackState, TrackedIdentity, TrackerSettings, TrackerUpdate};
pub use tripwire::{TripwireObservation, TripwireSensor, TripwireSettings, TripwireState};
pub use zone::CountZone;
