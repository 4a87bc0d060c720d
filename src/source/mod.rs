//! Chunk sources.
//!
//! A session owns exactly one source at a time. All three variants expose
//! the same capability: produce the next chunk, or fail with a classified
//! [`SourceError`]. Local variants pace themselves to the session cadence so
//! consumers see the same delivery timing whichever source is active.

/// Live device stream behind an injected connector.
pub mod remote;
/// Looping playback of a recorded file.
pub mod replay;
/// Gaussian noise generator.
pub mod synthetic;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkShape};
use crate::config::DeviceConfig;
use crate::error::SourceError;

pub use remote::{classify_message, ChunkStream, RemoteStream, StreamConnector};
pub use replay::{decode_f32_le, read_recording, FileReplay};
pub use synthetic::SyntheticNoise;

/// Which kind of source is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The device's streaming call.
    Remote,
    /// A replayed recording.
    File,
    /// Gaussian noise.
    Synthetic,
}

/// The active producer of a session.
#[derive(Debug)]
pub enum ChunkSource {
    /// Chunks read from the device.
    Remote(RemoteStream),
    /// Chunks cut from a recording, looping at its end.
    File(FileReplay),
    /// Generated chunks.
    Synthetic(SyntheticNoise),
}

impl ChunkSource {
    /// Kind tag of this source.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::Remote(_) => SourceKind::Remote,
            Self::File(_) => SourceKind::File,
            Self::Synthetic(_) => SourceKind::Synthetic,
        }
    }

    /// Waits for and returns the next chunk.
    pub async fn next_chunk(&mut self) -> Result<Chunk, SourceError> {
        match self {
            Self::Remote(remote) => remote.next_chunk().await,
            Self::File(replay) => Ok(replay.next_chunk().await),
            Self::Synthetic(noise) => Ok(noise.next_chunk().await),
        }
    }

    /// Local replacement for an unreachable device.
    ///
    /// Replays the configured file when it can be read, otherwise generates
    /// noise. Never fails.
    pub async fn fallback(device: &DeviceConfig, shape: ChunkShape, period: Duration) -> Self {
        match &device.replay_file {
            Some(path) => {
                let opened = FileReplay::open(
                    path,
                    device.replay_channels,
                    &device.requested_channels(),
                    shape.samples_per_channel,
                    period,
                )
                .await;
                match opened {
                    Ok(replay) => {
                        info!(
                            device_id = %device.id,
                            path = %path.display(),
                            samples = replay.total_samples(),
                            channels = device.replay_channels,
                            "file fallback"
                        );
                        return Self::File(replay);
                    }
                    Err(err) => {
                        warn!(device_id = %device.id, error = %err, "cannot replay file, using synthetic noise");
                    }
                }
            }
            None => debug!(device_id = %device.id, "no replay file configured"),
        }

        info!(device_id = %device.id, channels = shape.channels, "gaussian noise fallback");
        Self::Synthetic(SyntheticNoise::new(shape.channels, shape.samples_per_channel, period))
    }
}

/// Fixed-period ticker of the local sources.
///
/// The first tick completes one full period after the first poll, and late
/// ticks are delayed rather than bunched up.
#[derive(Debug)]
pub(crate) struct Cadence {
    period: Duration,
    interval: Option<Interval>,
}

impl Cadence {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            interval: None,
        }
    }

    pub(crate) async fn tick(&mut self) {
        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
    }
}
