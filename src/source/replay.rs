use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::error::SourceError;
use crate::source::Cadence;

/// Decodes headerless little-endian `f32` samples. Trailing bytes that do not
/// form a whole sample are ignored.
#[must_use]
pub fn decode_f32_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Reads a whole recording into shared memory.
pub async fn read_recording(path: &Path) -> Result<Arc<[f32]>, SourceError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        SourceError::config_missing(format!("cannot read {}: {err}", path.display()))
    })?;
    Ok(decode_f32_le(&bytes).into())
}

/// Looping playback of a channel-major recording.
///
/// The recording holds `file_channels` equally long channels. Each chunk
/// takes `samples_per_channel` samples at the current offset from every
/// selected channel; when fewer than that remain, the offset wraps to 0
/// first.
#[derive(Debug)]
pub struct FileReplay {
    path: Option<PathBuf>,
    samples: Arc<[f32]>,
    channel_length: usize,
    selected: Vec<usize>,
    samples_per_channel: usize,
    offset: usize,
    cadence: Cadence,
}

impl FileReplay {
    /// Reads the recording at `path` once.
    ///
    /// Session channel `c` replays file channel `c % file_channels`. An
    /// unreadable file, or one too short to yield a single chunk, is a
    /// [`SourceError::ConfigMissing`].
    pub async fn open(
        path: &Path,
        file_channels: usize,
        session_channels: &[u32],
        samples_per_channel: usize,
        period: Duration,
    ) -> Result<Self, SourceError> {
        let samples = read_recording(path).await?;
        let mut replay = Self::from_shared(samples, file_channels, session_channels, samples_per_channel, period)?;
        replay.path = Some(path.to_path_buf());
        Ok(replay)
    }

    /// Builds a replay over samples already in memory.
    pub fn from_shared(
        samples: Arc<[f32]>,
        file_channels: usize,
        session_channels: &[u32],
        samples_per_channel: usize,
        period: Duration,
    ) -> Result<Self, SourceError> {
        let file_channels = file_channels.max(1);
        let channel_length = samples.len() / file_channels;
        if channel_length < samples_per_channel || samples_per_channel == 0 {
            return Err(SourceError::config_missing(format!(
                "recording has {channel_length} samples per channel, need at least {samples_per_channel}"
            )));
        }
        let selected = session_channels
            .iter()
            .map(|&ch| ch as usize % file_channels)
            .collect();

        Ok(Self {
            path: None,
            samples,
            channel_length,
            selected,
            samples_per_channel,
            offset: 0,
            cadence: Cadence::new(period),
        })
    }

    /// Starts playback at `offset` samples into every channel.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Builds the next chunk immediately, without waiting for the cadence.
    pub fn build_chunk(&mut self) -> Chunk {
        let spc = self.samples_per_channel;
        if self.offset + spc > self.channel_length {
            self.offset = 0;
        }

        let mut out = Vec::with_capacity(self.selected.len() * spc);
        for &src in &self.selected {
            let start = src * self.channel_length + self.offset;
            out.extend_from_slice(&self.samples[start..start + spc]);
        }
        self.offset += spc;
        Chunk::new(out)
    }

    /// Waits one cadence period, then returns the next chunk.
    pub async fn next_chunk(&mut self) -> Chunk {
        self.cadence.tick().await;
        self.build_chunk()
    }

    /// Read position of the next chunk, before wrapping.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of samples in the whole recording.
    #[must_use]
    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    /// File the samples were read from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
