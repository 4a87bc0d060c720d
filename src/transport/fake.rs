use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::chunk::SAMPLES_PER_CHANNEL;
use crate::config::DEFAULT_CHANNEL_COUNT;
use crate::source::{ChunkSource, FileReplay, SyntheticNoise};

use super::proto::acquisition_service_server::{AcquisitionService, AcquisitionServiceServer};
use super::proto::{ChannelsRequest, FloatChunk};

/// Stride of the per-instance replay offset, in samples.
const OFFSET_STRIDE: usize = 7_919;
/// Offsets are kept below this many samples.
const OFFSET_SPAN: usize = 50_000;

/// Stand-in for an acquisition device.
///
/// Serves `StreamChunks` from a shared recording, or from Gaussian noise when
/// there is none. Instances start their replay at different offsets so that
/// several fake devices are out of phase.
#[derive(Clone)]
pub struct FakeAcquisitionService {
    base_channel: u32,
    recording: Option<Arc<[f32]>>,
    recording_channels: usize,
    samples_per_channel: usize,
    period: Duration,
}

impl FakeAcquisitionService {
    /// Device whose default channel set starts at `base_channel`.
    #[must_use]
    pub fn new(base_channel: u32) -> Self {
        Self {
            base_channel,
            recording: None,
            recording_channels: crate::config::DEFAULT_REPLAY_CHANNELS,
            samples_per_channel: SAMPLES_PER_CHANNEL,
            period: Duration::from_millis(100),
        }
    }

    /// Replays `samples`, a recording of `channels` channels.
    #[must_use]
    pub fn with_recording(mut self, samples: Arc<[f32]>, channels: usize) -> Self {
        self.recording = Some(samples);
        self.recording_channels = channels;
        self
    }

    /// Interval between chunks of one stream.
    #[must_use]
    pub const fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Replay offset of this instance.
    #[must_use]
    pub const fn start_offset(&self) -> usize {
        (self.base_channel as usize * OFFSET_STRIDE) % OFFSET_SPAN
    }

    /// Wraps the service for `Server::add_service`.
    #[must_use]
    pub fn into_server(self) -> AcquisitionServiceServer<Self> {
        AcquisitionServiceServer::new(self)
    }

    fn source_for(&self, channels: &[u32]) -> ChunkSource {
        if let Some(samples) = &self.recording {
            match FileReplay::from_shared(
                Arc::clone(samples),
                self.recording_channels,
                channels,
                self.samples_per_channel,
                self.period,
            ) {
                Ok(replay) => return ChunkSource::File(replay.with_offset(self.start_offset())),
                Err(err) => debug!(error = %err, "recording unusable, serving noise"),
            }
        }
        ChunkSource::Synthetic(SyntheticNoise::new(
            channels.len(),
            self.samples_per_channel,
            self.period,
        ))
    }
}

impl fmt::Debug for FakeAcquisitionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeAcquisitionService")
            .field("base_channel", &self.base_channel)
            .field("recording_samples", &self.recording.as_ref().map(|r| r.len()))
            .field("recording_channels", &self.recording_channels)
            .field("period", &self.period)
            .finish()
    }
}

#[tonic::async_trait]
impl AcquisitionService for FakeAcquisitionService {
    type StreamChunksStream = ReceiverStream<Result<FloatChunk, Status>>;

    async fn stream_chunks(
        &self,
        request: Request<ChannelsRequest>,
    ) -> Result<Response<Self::StreamChunksStream>, Status> {
        let req = request.into_inner();
        let channels = if req.channels.is_empty() {
            (self.base_channel..self.base_channel + DEFAULT_CHANNEL_COUNT).collect()
        } else {
            req.channels
        };
        debug!(base_channel = self.base_channel, channels = channels.len(), "StreamChunks started");

        let mut source = self.source_for(&channels);
        let (tx, rx) = mpsc::channel::<Result<FloatChunk, Status>>(4);
        tokio::spawn(async move {
            loop {
                let Ok(chunk) = source.next_chunk().await else {
                    break;
                };
                let msg = FloatChunk {
                    data: chunk.samples().to_vec(),
                };
                if tx.send(Ok(msg)).await.is_err() {
                    debug!("StreamChunks cancelled by client");
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
