//! One session per configured device.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{DeviceRegistry, SessionTuning};
use crate::error::{ConfigError, RelayError, RelayResult};
use crate::health::stream::health_channel;
use crate::health::HealthStream;
use crate::session::{ConsumerId, SessionStatus, SourceSession};
use crate::source::StreamConnector;

/// Owns the sessions of every registered device.
///
/// Sessions are independent; the hub only starts and stops them together
/// and routes lookups by device id.
#[derive(Debug)]
pub struct RelayHub {
    tuning: SessionTuning,
    sessions: BTreeMap<String, SourceSession>,
    order: Vec<String>,
}

impl RelayHub {
    /// Builds an idle session for every device in `registry`.
    pub fn from_registry(
        registry: &DeviceRegistry,
        tuning: SessionTuning,
        connector: Arc<dyn StreamConnector>,
    ) -> Result<Self, ConfigError> {
        tuning.validate()?;
        let mut sessions = BTreeMap::new();
        let mut order = Vec::with_capacity(registry.len());
        for device in registry.iter() {
            let session = SourceSession::new(device.clone(), tuning.clone(), Arc::clone(&connector))?;
            order.push(device.id.clone());
            sessions.insert(device.id.clone(), session);
        }
        Ok(Self {
            tuning,
            sessions,
            order,
        })
    }

    /// Starts every session that is not already running.
    pub fn start_all(&self) -> RelayResult<()> {
        for session in self.iter() {
            session.start()?;
        }
        info!(devices = self.sessions.len(), "all sessions started");
        Ok(())
    }

    /// Stops every session.
    pub fn stop_all(&self) {
        for session in self.iter() {
            session.stop();
        }
        info!(devices = self.sessions.len(), "all sessions stopped");
    }

    /// Session of `device_id`, if registered.
    #[must_use]
    pub fn session(&self, device_id: &str) -> Option<&SourceSession> {
        self.sessions.get(device_id)
    }

    /// Like [`RelayHub::session`], failing with `UnknownDevice`.
    pub fn get(&self, device_id: &str) -> RelayResult<&SourceSession> {
        self.session(device_id).ok_or_else(|| RelayError::UnknownDevice {
            id: device_id.to_string(),
        })
    }

    /// Sessions in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &SourceSession> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true when no device is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes `consumer` from every session, as when it disconnects.
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_everywhere(&self, consumer: &ConsumerId) -> usize {
        self.iter().filter(|s| s.unsubscribe(consumer)).count()
    }

    /// Status of every session, in configuration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.iter().map(SourceSession::status).collect()
    }

    /// Health transitions of one device, or of all devices when `device_id`
    /// is `None`.
    pub fn watch_health(&self, device_id: Option<&str>) -> RelayResult<HealthStream> {
        match device_id {
            Some(id) => Ok(self.get(id)?.watch_health()),
            None => {
                let (sink, stream) = health_channel(self.tuning.health_stream_capacity * self.sessions.len().max(1));
                for session in self.iter() {
                    session.attach_health_sink(sink.clone());
                }
                Ok(stream)
            }
        }
    }
}
