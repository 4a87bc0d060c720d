//! Per-device streaming session.
//!
//! A [`SourceSession`] owns one active chunk source, fails over between the
//! remote device, a replay file and synthetic noise, runs the signal monitor
//! over every chunk and fans chunks out to its subscribers.
//!
//! ```text
//! Idle ──start──> ConnectingRemote ──accepted──> StreamingRemote
//!                   │                               │ transient failure
//!                   │ unavailable                   v
//!                   │                          ReconnectWait ──delay──> ConnectingRemote
//!                   v
//!          StreamingFile | StreamingSynthetic
//!
//! any state ──stop──> Stopped ──start──> ConnectingRemote
//! ```

/// Channel windowing and batching.
pub mod broadcast;
mod driver;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::info;

use crate::chunk::ChunkShape;
use crate::config::{DeviceConfig, SessionTuning};
use crate::error::{ConfigError, RelayError, RelayResult};
use crate::health::stream::{health_channel, HealthNotifier, HealthSink};
use crate::health::{HealthStream, SignalMonitor};
use crate::source::{SourceKind, StreamConnector};

pub use broadcast::{Broadcaster, ConsumerId, EmitFn, ReadyBatch};

use driver::OwnedTask;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Built, never started.
    Idle,
    /// Opening the remote call.
    ConnectingRemote,
    /// Receiving chunks from the device.
    StreamingRemote,
    /// Waiting out the reconnect delay after a remote failure.
    ReconnectWait,
    /// Replaying the recording in place of the device.
    StreamingFile,
    /// Generating noise in place of the device.
    StreamingSynthetic,
    /// Stopped; `start` opens the remote call again.
    Stopped,
}

impl SessionPhase {
    /// Returns true between `start` and `stop`.
    #[must_use]
    pub const fn is_running(self) -> bool {
        !matches!(self, Self::Idle | Self::Stopped)
    }

    /// Returns true while local data stands in for the device.
    #[must_use]
    pub const fn is_fallback(self) -> bool {
        matches!(self, Self::StreamingFile | Self::StreamingSynthetic)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ConnectingRemote => "connecting_remote",
            Self::StreamingRemote => "streaming_remote",
            Self::ReconnectWait => "reconnect_wait",
            Self::StreamingFile => "streaming_file",
            Self::StreamingSynthetic => "streaming_synthetic",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters of one session, cumulative across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Chunks that passed validation and reached the monitor and subscribers.
    pub chunks_delivered: u64,
    /// Malformed chunks discarded.
    pub chunks_dropped: u64,
    /// Remote calls accepted by the device.
    pub remote_connections: u64,
    /// Reconnect timers armed after a remote failure.
    pub reconnects_scheduled: u64,
    /// Switches to a local source.
    pub fallbacks: u64,
    /// Health events lost to full streams.
    pub health_events_dropped: u64,
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Device identifier.
    pub device_id: String,
    /// Human-readable device name.
    pub name: String,
    /// Configured device address.
    pub address: String,
    /// Current lifecycle phase.
    pub phase: SessionPhase,
    /// Kind of the producing source, if any.
    pub active_source: Option<SourceKind>,
    /// Current health flag.
    pub unhealthy: bool,
    /// Anomaly count of the latest chunk.
    pub last_anomaly_count: usize,
    /// Subscribed consumers.
    pub subscribers: usize,
    /// Health callbacks plus open health streams.
    pub health_listeners: usize,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Wall-clock time of the latest delivered chunk.
    pub last_chunk_at: Option<DateTime<Utc>>,
    /// Cumulative counters.
    pub stats: SessionStats,
}

pub(crate) struct SessionInner {
    config: DeviceConfig,
    tuning: SessionTuning,
    shape: ChunkShape,
    connector: Arc<dyn StreamConnector>,
    state: Mutex<SessionState>,
    /// Held for a whole delivery, callbacks included. Reentrant so that a
    /// callback may stop its own session.
    delivery: ReentrantMutex<()>,
}

pub(crate) struct SessionState {
    phase: SessionPhase,
    /// Bumped on every transition; tasks of older generations are inert.
    generation: u64,
    ever_connected: bool,
    monitor: SignalMonitor,
    broadcaster: Broadcaster,
    health: HealthNotifier,
    producer: Option<OwnedTask>,
    reconnect: Option<OwnedTask>,
    active_source: Option<SourceKind>,
    stats: SessionStats,
    last_chunk_at: Option<DateTime<Utc>>,
}

/// Streaming session of one device.
///
/// Cheap to clone; clones share the same session. The session's tasks hold
/// only weak references, so dropping the last clone cancels everything.
///
/// Emit callbacks and health listeners run after the session lock is
/// released and may call back into the same session, including stopping it.
#[derive(Clone)]
pub struct SourceSession {
    inner: Arc<SessionInner>,
}

impl SourceSession {
    /// Builds an idle session. Invalid device or tuning settings are the
    /// only errors a session ever reports.
    pub fn new(
        config: DeviceConfig,
        tuning: SessionTuning,
        connector: Arc<dyn StreamConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tuning.validate()?;

        let shape = tuning.shape_for(&config);
        let state = SessionState {
            phase: SessionPhase::Idle,
            generation: 0,
            ever_connected: false,
            monitor: SignalMonitor::new(tuning.monitor.clone()),
            broadcaster: Broadcaster::new(shape.channels, tuning.batch_size),
            health: HealthNotifier::default(),
            producer: None,
            reconnect: None,
            active_source: None,
            stats: SessionStats::default(),
            last_chunk_at: None,
        };

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                tuning,
                shape,
                connector,
                state: Mutex::new(state),
                delivery: ReentrantMutex::new(()),
            }),
        })
    }

    /// Identifier of the device this session relays.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.config.id
    }

    /// Device configuration the session was built with.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Chunk geometry every delivered chunk has.
    #[must_use]
    pub fn shape(&self) -> ChunkShape {
        self.inner.shape
    }

    /// Starts streaming: opens the remote call immediately.
    ///
    /// A no-op while the session is already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> RelayResult<()> {
        Handle::try_current().map_err(|_| RelayError::internal("session start requires a tokio runtime"))?;

        let mut st = self.inner.state.lock();
        if st.phase.is_running() {
            return Ok(());
        }
        info!(device_id = %self.inner.config.id, "starting session");
        st.ever_connected = false;
        driver::begin_connect(&self.inner, &mut st);
        Ok(())
    }

    /// Stops the session from any state. Idempotent.
    ///
    /// When this returns no task of the session is left and no further chunk
    /// or health event will be delivered. Subscriptions are kept for a later
    /// `start`.
    pub fn stop(&self) {
        let mut st = self.inner.state.lock();
        if st.phase == SessionPhase::Stopped {
            return;
        }
        let was = st.phase;
        driver::halt(&mut st);
        drop(st);

        // Wait out a delivery already past its generation check.
        drop(self.inner.delivery.lock());
        info!(device_id = %self.inner.config.id, from = %was, "session stopped");
    }

    /// Stops and starts again, retrying the remote device even after a
    /// permanent fallback. The fallback source is released before the new
    /// connection attempt.
    pub fn restart(&self) -> RelayResult<()> {
        Handle::try_current().map_err(|_| RelayError::internal("session restart requires a tokio runtime"))?;

        let mut st = self.inner.state.lock();
        driver::halt(&mut st);
        info!(device_id = %self.inner.config.id, "restarting session");
        st.ever_connected = false;
        driver::begin_connect(&self.inner, &mut st);
        Ok(())
    }

    /// Registers `consumer` for the channels at `positions`, replacing any
    /// earlier subscription of the same consumer.
    ///
    /// `emit` receives one flattened, channel-major batch every
    /// `batch_size` chunks.
    pub fn subscribe<F>(
        &self,
        consumer: impl Into<ConsumerId>,
        positions: Vec<usize>,
        emit: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&ConsumerId, Vec<f32>) + Send + Sync + 'static,
    {
        let consumer = consumer.into();
        let mut st = self.inner.state.lock();
        st.broadcaster.subscribe(consumer.clone(), positions, Arc::new(emit))?;
        info!(device_id = %self.inner.config.id, consumer = %consumer, subscribers = st.broadcaster.len(), "consumer subscribed");
        Ok(())
    }

    /// Removes the subscription of `consumer`, discarding its partial batch.
    /// Returns false if it had none.
    pub fn unsubscribe(&self, consumer: &ConsumerId) -> bool {
        let mut st = self.inner.state.lock();
        let removed = st.broadcaster.unsubscribe(consumer);
        if removed {
            info!(device_id = %self.inner.config.id, consumer = %consumer, "consumer unsubscribed");
        }
        removed
    }

    /// Calls `listener(device_id, unhealthy)` on every health-flag transition.
    pub fn on_health_change<F>(&self, listener: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.inner.state.lock().health.add_listener(Arc::new(listener));
    }

    /// Stream of this session's health transitions.
    #[must_use]
    pub fn watch_health(&self) -> HealthStream {
        let (sink, stream) = health_channel(self.inner.tuning.health_stream_capacity);
        self.attach_health_sink(sink);
        stream
    }

    pub(crate) fn attach_health_sink(&self, sink: HealthSink) {
        self.inner.state.lock().health.add_stream(sink);
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Current health flag (`true` while in maintenance).
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.inner.state.lock().monitor.is_unhealthy()
    }

    /// Anomaly count of the most recent delivered chunk.
    #[must_use]
    pub fn last_anomaly_count(&self) -> usize {
        self.inner.state.lock().monitor.last_count()
    }

    /// Number of subscribed consumers.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().broadcaster.len()
    }

    /// Kind of the source currently producing, if any.
    #[must_use]
    pub fn active_source(&self) -> Option<SourceKind> {
        self.inner.state.lock().active_source
    }

    /// Returns true while a reconnect timer is armed.
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.inner.state.lock().reconnect.is_some()
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let st = self.inner.state.lock();
        SessionStats {
            health_events_dropped: st.health.dropped(),
            ..st.stats
        }
    }

    /// Snapshot of phase, health and counters.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let st = self.inner.state.lock();
        SessionStatus {
            device_id: self.inner.config.id.clone(),
            name: self.inner.config.name.clone(),
            address: self.inner.config.address.clone(),
            phase: st.phase,
            active_source: st.active_source,
            unhealthy: st.monitor.is_unhealthy(),
            last_anomaly_count: st.monitor.last_count(),
            subscribers: st.broadcaster.len(),
            health_listeners: st.health.listener_count(),
            reconnect_pending: st.reconnect.is_some(),
            last_chunk_at: st.last_chunk_at,
            stats: SessionStats {
                health_events_dropped: st.health.dropped(),
                ..st.stats
            },
        }
    }
}

impl fmt::Debug for SourceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSession")
            .field("device_id", &self.inner.config.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
