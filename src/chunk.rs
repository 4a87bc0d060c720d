//! Chunk type and shape validation.
//!
//! A chunk is one production tick worth of samples, channel-major: all
//! samples of channel 0, then channel 1, and so on.

use std::fmt;
use std::sync::Arc;

use crate::error::SourceError;

/// Samples per channel in one chunk at the default cadence.
pub const SAMPLES_PER_CHANNEL: usize = 160;

/// Immutable, cheaply shareable block of channel-major samples.
#[derive(Clone, PartialEq)]
pub struct Chunk(Arc<[f32]>);

impl Chunk {
    /// Wraps owned samples.
    #[must_use]
    pub fn new(samples: Vec<f32>) -> Self {
        Self(samples.into())
    }

    /// All samples, channel-major.
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.0
    }

    /// Total number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the chunk carries no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks the chunk against the shape its session was built for.
    pub fn validate(&self, shape: ChunkShape) -> Result<(), SourceError> {
        let len = self.len();
        if len == 0 || len % shape.samples_per_channel != 0 || len != shape.len() {
            return Err(SourceError::MalformedChunk {
                len,
                expected: shape.len(),
            });
        }
        Ok(())
    }
}

impl From<Vec<f32>> for Chunk {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.len()).finish()
    }
}

/// Fixed chunk geometry of a session.
///
/// The channel count never changes for the lifetime of a session; chunks of
/// any other length are rejected rather than re-strided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkShape {
    /// Channels per chunk.
    pub channels: usize,
    /// Samples per channel per chunk.
    pub samples_per_channel: usize,
}

impl ChunkShape {
    /// Creates a shape.
    #[must_use]
    pub const fn new(channels: usize, samples_per_channel: usize) -> Self {
        Self {
            channels,
            samples_per_channel,
        }
    }

    /// Expected number of samples in a chunk.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.channels * self.samples_per_channel
    }

    /// Returns true if the shape describes an empty chunk.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_chunk() {
        let shape = ChunkShape::new(4, SAMPLES_PER_CHANNEL);
        let chunk = Chunk::new(vec![0.0; 4 * SAMPLES_PER_CHANNEL]);
        assert!(chunk.validate(shape).is_ok());
    }

    #[test]
    fn test_partial_channel_rejected() {
        let shape = ChunkShape::new(4, SAMPLES_PER_CHANNEL);
        let chunk = Chunk::new(vec![0.0; 4 * SAMPLES_PER_CHANNEL - 1]);
        let err = chunk.validate(shape).unwrap_err();
        assert_eq!(
            err,
            SourceError::MalformedChunk {
                len: 4 * SAMPLES_PER_CHANNEL - 1,
                expected: 4 * SAMPLES_PER_CHANNEL,
            }
        );
    }

    #[test]
    fn test_channel_count_divergence_rejected() {
        // Whole channels, but not the session's channel count.
        let shape = ChunkShape::new(4, SAMPLES_PER_CHANNEL);
        let chunk = Chunk::new(vec![0.0; 8 * SAMPLES_PER_CHANNEL]);
        assert!(chunk.validate(shape).is_err());
    }

    #[test]
    fn test_empty_chunk_rejected() {
        let shape = ChunkShape::new(1, SAMPLES_PER_CHANNEL);
        assert!(Chunk::new(Vec::new()).validate(shape).is_err());
    }

    #[test]
    fn test_clone_shares_samples() {
        let chunk = Chunk::new(vec![1.0, 2.0]);
        let copy = chunk.clone();
        assert!(std::ptr::eq(chunk.samples().as_ptr(), copy.samples().as_ptr()));
    }
}
