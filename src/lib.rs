//! # chanrelay - per-device telemetry sessions with failover and fan-out
//!
//! chanrelay ingests continuous multi-channel samples from independent
//! acquisition devices and republishes them to any number of consumers,
//! each of which picks its own subset of channels.
//!
//! ## Core Concepts
//!
//! - **Chunk**: one production tick of channel-major samples (160 per channel)
//! - **SourceSession**: one per device; owns exactly one active source and
//!   fails over from the live device to a replay file or synthetic noise
//! - **SignalMonitor**: amplitude-threshold anomaly counter driving a
//!   hysteresis health flag
//! - **Broadcaster**: per-consumer channel windowing and batching
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chanrelay::{DeviceConfig, SessionTuning, SourceSession};
//! use chanrelay::transport::GrpcConnector;
//!
//! let device = DeviceConfig::new("mea-1", "localhost:5051").with_channels(0..32);
//! let session = SourceSession::new(device, SessionTuning::default(), Arc::new(GrpcConnector::new()))?;
//!
//! session.subscribe("dashboard", vec![2, 0], |consumer, batch| {
//!     println!("{consumer}: {} samples", batch.len());
//! })?;
//! session.on_health_change(|device_id, unhealthy| {
//!     println!("{device_id} maintenance={unhealthy}");
//! });
//! session.start()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod chunk;
pub mod config;
pub mod error;

// Sources, monitor and sessions
pub mod health;
pub mod hub;
pub mod session;
pub mod source;

// gRPC transport (feature-gated)
#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use chunk::{Chunk, ChunkShape, SAMPLES_PER_CHANNEL};
pub use config::{DeviceConfig, DeviceRegistry, MonitorConfig, RelayConfig, SessionTuning};
pub use error::{ConfigError, RelayError, RelayResult, SourceError, TransportError};
pub use health::{count_anomalies, HealthEvent, HealthListener, HealthStream, SignalMonitor};
pub use hub::RelayHub;
pub use session::{
    Broadcaster, ConsumerId, EmitFn, ReadyBatch, SessionPhase, SessionStats, SessionStatus,
    SourceSession,
};
pub use source::{ChunkSource, ChunkStream, SourceKind, StreamConnector};
