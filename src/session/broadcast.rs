//! Per-consumer channel windowing and batching.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Opaque consumer identity, unique per logical consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Wraps a caller-chosen id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConsumerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Delivery callback: receives the consumer id and one flattened batch.
///
/// Runs on the session's delivery path after the session lock is released.
/// It may call back into the session, for instance to unsubscribe itself,
/// but it delays the next chunk and should hand the batch off quickly.
pub type EmitFn = Arc<dyn Fn(&ConsumerId, Vec<f32>) + Send + Sync>;

/// A completed batch waiting to be handed to its consumer.
pub struct ReadyBatch {
    consumer: ConsumerId,
    samples: Vec<f32>,
    emit: EmitFn,
}

impl ReadyBatch {
    /// Consumer the batch belongs to.
    #[must_use]
    pub const fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Flattened, channel-major samples.
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Calls the consumer's emit callback with the batch.
    pub fn dispatch(self) {
        (self.emit)(&self.consumer, self.samples);
    }
}

impl fmt::Debug for ReadyBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyBatch")
            .field("consumer", &self.consumer)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

struct Subscription {
    positions: Vec<usize>,
    /// One accumulated sample run per requested position.
    buffers: Vec<Vec<f32>>,
    chunks: usize,
    emit: EmitFn,
}

impl Subscription {
    fn new(positions: Vec<usize>, emit: EmitFn) -> Self {
        let buffers = vec![Vec::new(); positions.len()];
        Self {
            positions,
            buffers,
            chunks: 0,
            emit,
        }
    }

    fn take_batch(&mut self) -> Vec<f32> {
        let total = self.buffers.iter().map(Vec::len).sum();
        let mut flat = Vec::with_capacity(total);
        for buf in &mut self.buffers {
            flat.append(buf);
        }
        self.chunks = 0;
        flat
    }
}

/// Subscription registry of one session.
///
/// At most one subscription exists per consumer id; subscribing again
/// replaces the previous entry and discards its partial batch.
pub struct Broadcaster {
    total_channels: usize,
    batch_size: usize,
    subs: HashMap<ConsumerId, Subscription>,
}

impl Broadcaster {
    /// Registry for a session with `total_channels` channels that delivers
    /// once every `batch_size` chunks.
    #[must_use]
    pub fn new(total_channels: usize, batch_size: usize) -> Self {
        Self {
            total_channels,
            batch_size: batch_size.max(1),
            subs: HashMap::new(),
        }
    }

    /// Registers or replaces the subscription of `consumer`.
    ///
    /// Positions index into the session's channel set, not raw channel
    /// numbers, and are delivered in the order given.
    pub fn subscribe(
        &mut self,
        consumer: ConsumerId,
        positions: Vec<usize>,
        emit: EmitFn,
    ) -> Result<(), ConfigError> {
        if let Some(&position) = positions.iter().find(|&&p| p >= self.total_channels) {
            return Err(ConfigError::ChannelPositionOutOfRange {
                position,
                total: self.total_channels,
            });
        }
        self.subs.insert(consumer, Subscription::new(positions, emit));
        Ok(())
    }

    /// Removes the subscription of `consumer`. Returns false if there was none.
    pub fn unsubscribe(&mut self, consumer: &ConsumerId) -> bool {
        self.subs.remove(consumer).is_some()
    }

    /// Appends the requested channels of one chunk to every subscription and
    /// returns the batches that reached the threshold.
    ///
    /// The per-channel stride is `chunk.len() / total_channels`. Returned
    /// batches are already reset on the subscription side; the caller
    /// dispatches them.
    #[must_use]
    pub fn deliver(&mut self, chunk: &[f32]) -> Vec<ReadyBatch> {
        if self.total_channels == 0 {
            return Vec::new();
        }
        let stride = chunk.len() / self.total_channels;

        let mut ready = Vec::new();
        for (consumer, sub) in &mut self.subs {
            for (buf, &pos) in sub.buffers.iter_mut().zip(&sub.positions) {
                let start = pos * stride;
                buf.extend_from_slice(&chunk[start..start + stride]);
            }
            sub.chunks += 1;
            if sub.chunks >= self.batch_size {
                ready.push(ReadyBatch {
                    consumer: consumer.clone(),
                    samples: sub.take_batch(),
                    emit: Arc::clone(&sub.emit),
                });
            }
        }
        ready
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Returns true when nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Chunks accumulated towards the next batch of `consumer`.
    #[must_use]
    pub fn pending_chunks(&self, consumer: &ConsumerId) -> Option<usize> {
        self.subs.get(consumer).map(|sub| sub.chunks)
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("total_channels", &self.total_channels)
            .field("batch_size", &self.batch_size)
            .field("subscriptions", &self.subs.len())
            .finish()
    }
}
