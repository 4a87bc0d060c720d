//! Device health tracking.
//!
//! Each session runs its own [`SignalMonitor`] over every chunk it delivers.
//! Flag transitions are fanned out to callback listeners and to pull-style
//! [`HealthStream`]s; raw anomaly counts are never sent to consumers.

/// Anomaly counting and hysteresis.
pub mod monitor;
/// Health event fan-out and subscriber stream handle.
pub mod stream;

pub use monitor::{count_anomalies, SignalMonitor};
pub use stream::{HealthEvent, HealthListener, HealthStream};
