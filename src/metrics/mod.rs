//! Metrics module - operation timings and performance profiles.

mod profiles;
mod recorder;

pub use profiles::{CaptureType, ProfileComparison, ProfileRepository, ProfileSnapshot};
pub use recorder::{MetricSnapshot, MetricsRecorder, measure};
