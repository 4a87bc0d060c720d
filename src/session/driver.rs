//! Session tasks and state transitions.
//!
//! Every producing task carries the generation it was spawned for. A
//! transition bumps the generation under the session lock, so a task of an
//! older generation can never deliver again, even if it is still running on
//! another worker when the transition happens. Together with aborting the
//! replaced task this keeps at most one source producing per session.

use std::future::Future;
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::error::SourceError;
use crate::source::{ChunkSource, RemoteStream, SourceKind};

use super::{SessionInner, SessionPhase, SessionState};

/// A spawned task owned by the session. Dropping it aborts the task.
#[derive(Debug)]
pub(crate) struct OwnedTask(Option<JoinHandle<()>>);

impl OwnedTask {
    /// Spawns on the current runtime. Callers must be inside one.
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(tokio::spawn(fut)))
    }

    /// Releases ownership without aborting. Used by a task that is about to
    /// finish on its own.
    pub(crate) fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for OwnedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Opens the remote stream, releasing whatever source was active.
pub(super) fn begin_connect(inner: &Arc<SessionInner>, st: &mut SessionState) {
    st.producer = None;
    st.reconnect = None;
    st.generation += 1;
    st.phase = SessionPhase::ConnectingRemote;
    st.active_source = None;

    info!(
        device_id = %inner.config.id,
        address = %inner.config.address,
        channels = inner.shape.channels,
        "connecting to device"
    );
    let weak = Arc::downgrade(inner);
    let gen = st.generation;
    st.producer = Some(OwnedTask::spawn(run_remote(weak, gen)));
}

/// Switches to the local fallback for the rest of this run.
pub(super) fn begin_fallback(inner: &Arc<SessionInner>, st: &mut SessionState) {
    st.producer = None;
    st.reconnect = None;
    st.generation += 1;
    st.active_source = None;
    st.stats.fallbacks += 1;

    let weak = Arc::downgrade(inner);
    let gen = st.generation;
    st.producer = Some(OwnedTask::spawn(run_fallback(weak, gen)));
}

/// Arms the reconnect timer. A second request while one is pending is a no-op.
pub(super) fn schedule_reconnect(inner: &Arc<SessionInner>, st: &mut SessionState) {
    if st.reconnect.is_some() {
        return;
    }
    st.producer = None;
    st.generation += 1;
    st.phase = SessionPhase::ReconnectWait;
    st.active_source = None;
    st.stats.reconnects_scheduled += 1;

    let delay = inner.tuning.reconnect_delay();
    info!(
        device_id = %inner.config.id,
        delay_ms = delay.as_millis() as u64,
        "scheduling reconnect"
    );
    let weak = Arc::downgrade(inner);
    let gen = st.generation;
    st.reconnect = Some(OwnedTask::spawn(async move {
        tokio::time::sleep(delay).await;
        reconnect_fire(&weak, gen);
    }));
}

/// Cancels every task and makes the session inert.
pub(super) fn halt(st: &mut SessionState) {
    st.producer = None;
    st.reconnect = None;
    st.generation += 1;
    st.phase = SessionPhase::Stopped;
    st.active_source = None;
}

fn reconnect_fire(weak: &Weak<SessionInner>, gen: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut st = inner.state.lock();
    if st.generation != gen || st.phase != SessionPhase::ReconnectWait {
        return;
    }
    if let Some(task) = st.reconnect.take() {
        task.detach();
    }
    begin_connect(&inner, &mut st);
}

async fn run_remote(weak: Weak<SessionInner>, gen: u64) {
    let Some((connector, address, channels)) = weak.upgrade().map(|inner| {
        (
            Arc::clone(&inner.connector),
            inner.config.address.clone(),
            inner.config.requested_channels(),
        )
    }) else {
        return;
    };

    let mut remote = match RemoteStream::connect(connector.as_ref(), &address, &channels).await {
        Ok(remote) => remote,
        Err(err) => {
            on_source_failure(&weak, gen, err);
            return;
        }
    };
    if !mark_active(&weak, gen, SourceKind::Remote) {
        return;
    }

    loop {
        match remote.next_chunk().await {
            Ok(chunk) => {
                if !deliver(&weak, gen, chunk) {
                    return;
                }
            }
            Err(err) => {
                on_source_failure(&weak, gen, err);
                return;
            }
        }
    }
}

async fn run_fallback(weak: Weak<SessionInner>, gen: u64) {
    let Some((device, shape, period)) = weak
        .upgrade()
        .map(|inner| (inner.config.clone(), inner.shape, inner.tuning.chunk_interval()))
    else {
        return;
    };

    let mut source = ChunkSource::fallback(&device, shape, period).await;
    if !mark_active(&weak, gen, source.kind()) {
        return;
    }

    loop {
        match source.next_chunk().await {
            Ok(chunk) => {
                if !deliver(&weak, gen, chunk) {
                    return;
                }
            }
            Err(err) => {
                on_source_failure(&weak, gen, err);
                return;
            }
        }
    }
}

/// Records that the source of generation `gen` is producing. Returns false
/// if the session has moved on.
fn mark_active(weak: &Weak<SessionInner>, gen: u64, kind: SourceKind) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let mut st = inner.state.lock();
    if st.generation != gen {
        return false;
    }
    st.active_source = Some(kind);
    st.phase = match kind {
        SourceKind::Remote => SessionPhase::StreamingRemote,
        SourceKind::File => SessionPhase::StreamingFile,
        SourceKind::Synthetic => SessionPhase::StreamingSynthetic,
    };
    if kind == SourceKind::Remote {
        st.ever_connected = true;
        st.stats.remote_connections += 1;
        info!(device_id = %inner.config.id, "remote stream established");
    }
    true
}

/// Picks the next state after the active source failed.
///
/// Unavailable endpoints fall back for the rest of the run. Other failures
/// reconnect after the configured delay, but only once the session has been
/// connected before; a device that never answered is treated as absent.
fn on_source_failure(weak: &Weak<SessionInner>, gen: u64, err: SourceError) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut st = inner.state.lock();
    if st.generation != gen {
        return;
    }
    if let Some(task) = st.producer.take() {
        task.detach();
    }

    if err.is_unavailable() || !st.ever_connected {
        warn!(device_id = %inner.config.id, error = %err, "device unreachable, falling back to local data");
        begin_fallback(&inner, &mut st);
    } else {
        warn!(device_id = %inner.config.id, error = %err, "remote stream failed");
        schedule_reconnect(&inner, &mut st);
    }
}

/// Runs one chunk through the monitor and the broadcaster. Returns false if
/// generation `gen` is no longer current.
///
/// State is updated under the session lock; listeners and emit callbacks run
/// after it is released, each only while `gen` is still current, so a
/// callback may stop or resubscribe on its own session.
fn deliver(weak: &Weak<SessionInner>, gen: u64, chunk: Chunk) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let _delivering = inner.delivery.lock();

    let (transition, ready) = {
        let mut guard = inner.state.lock();
        let st = &mut *guard;
        if st.generation != gen {
            return false;
        }

        if let Err(err) = chunk.validate(inner.shape) {
            st.stats.chunks_dropped += 1;
            debug!(device_id = %inner.config.id, error = %err, "dropping chunk");
            return true;
        }

        st.stats.chunks_delivered += 1;
        st.last_chunk_at = Some(Utc::now());
        let transition = match st.monitor.observe(chunk.samples()) {
            Some(unhealthy) => {
                info!(
                    device_id = %inner.config.id,
                    unhealthy,
                    anomalies = st.monitor.last_count(),
                    "health flag changed"
                );
                Some((unhealthy, st.health.notify(&inner.config.id, unhealthy)))
            }
            None => None,
        };
        (transition, st.broadcaster.deliver(chunk.samples()))
    };

    let current = || inner.state.lock().generation == gen;
    if let Some((unhealthy, listeners)) = transition {
        for listener in listeners {
            if !current() {
                return false;
            }
            listener(&inner.config.id, unhealthy);
        }
    }
    for batch in ready {
        if !current() {
            return false;
        }
        batch.dispatch();
    }
    true
}
