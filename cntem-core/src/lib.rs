pub mod types;
pub mod error;
pub mod config;

pub use error::{Error, Result};
pub use types::{BoundingBox, Detection, Frame, Point2, RawPrediction};
pub use config::{ConfigFormat, CounterConfig, DecoderConfig, EvidenceMode, ZoneInsets};
