use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Callback invoked with `(device_id, unhealthy)` on every flag transition.
///
/// Listeners run on the session's delivery path, after the session lock is
/// released, and may call back into the session.
pub type HealthListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// One health-flag transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// Device whose flag changed.
    pub device_id: String,
    /// New flag value.
    pub unhealthy: bool,
    /// When the transition was observed.
    pub at: DateTime<Utc>,
}

impl HealthEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn now(device_id: impl Into<String>, unhealthy: bool) -> Self {
        Self {
            device_id: device_id.into(),
            unhealthy,
            at: Utc::now(),
        }
    }
}

/// Sending half of a [`HealthStream`], shared by every notifier it is
/// attached to.
#[derive(Debug, Clone)]
pub(crate) struct HealthSink {
    tx: Sender<HealthEvent>,
    closed: Arc<AtomicBool>,
}

impl HealthSink {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub(crate) fn health_channel(capacity: usize) -> (HealthSink, HealthStream) {
    let (tx, rx) = bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        HealthSink {
            tx,
            closed: Arc::clone(&closed),
        },
        HealthStream::new(rx, closed),
    )
}

/// Fan-out of health transitions to listeners and streams.
///
/// Stream sends never block the session: a full stream loses the event.
/// Streams that were dropped or unsubscribed are forgotten the next time the
/// notifier is touched.
#[derive(Default)]
pub(crate) struct HealthNotifier {
    listeners: Vec<HealthListener>,
    streams: Vec<HealthSink>,
    dropped: u64,
}

impl HealthNotifier {
    pub(crate) fn add_listener(&mut self, listener: HealthListener) {
        self.listeners.push(listener);
    }

    pub(crate) fn add_stream(&mut self, sink: HealthSink) {
        self.prune();
        self.streams.push(sink);
    }

    /// Sends the transition to every open stream and returns the listeners
    /// to call once the session lock is released.
    pub(crate) fn notify(&mut self, device_id: &str, unhealthy: bool) -> Vec<HealthListener> {
        self.prune();
        if !self.streams.is_empty() {
            let event = HealthEvent::now(device_id, unhealthy);
            let mut dropped = 0;
            self.streams.retain(|sink| match sink.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
            self.dropped += dropped;
        }
        self.listeners.clone()
    }

    fn prune(&mut self) {
        self.streams.retain(|sink| !sink.is_closed());
    }

    pub(crate) const fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len() + self.streams.iter().filter(|sink| !sink.is_closed()).count()
    }
}

impl fmt::Debug for HealthNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthNotifier")
            .field("listeners", &self.listeners.len())
            .field("streams", &self.streams.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

/// A subscription stream of health transitions.
///
/// Dropping the stream unregisters it from every session it watches.
#[derive(Debug)]
pub struct HealthStream {
    rx: Receiver<HealthEvent>,
    closed: Arc<AtomicBool>,
}

impl HealthStream {
    const fn new(rx: Receiver<HealthEvent>, closed: Arc<AtomicBool>) -> Self {
        Self { rx, closed }
    }

    /// Explicit unregistration. Non-blocking and idempotent.
    ///
    /// Events already queued can still be received; once the sessions have
    /// forgotten the stream it becomes disconnected.
    pub fn unsubscribe(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> RelayResult<HealthEvent> {
        self.rx.recv().map_err(|_| RelayError::Disconnected {
            path: "health_stream".to_string(),
        })
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> RelayResult<HealthEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RelayError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => RelayError::Disconnected {
                path: "health_stream".to_string(),
            },
        })
    }

    /// Takes a queued event without waiting.
    pub fn try_recv(&self) -> RelayResult<Option<HealthEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RelayError::Disconnected {
                path: "health_stream".to_string(),
            }),
        }
    }
}

impl Drop for HealthStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
