use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tracing::debug;

use crate::config::endpoint_uri;
use crate::error::SourceError;
use crate::source::{classify_message, ChunkStream, StreamConnector};

use super::proto::acquisition_service_client::AcquisitionServiceClient;
use super::proto::ChannelsRequest;

/// Opens `StreamChunks` on real (or fake) acquisition devices.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(5),
        }
    }
}

impl GrpcConnector {
    /// Connector with a 5 s connect timeout and HTTP/2 keepalive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on establishing the TCP/HTTP2 connection.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, SourceError> {
        let endpoint = Endpoint::from_shared(endpoint_uri(address))
            .map_err(|e| SourceError::unavailable(format!("invalid endpoint '{address}': {e}")))?;
        Ok(endpoint
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(true))
    }
}

/// Classifies a status returned while opening the call.
#[must_use]
pub fn classify_status(status: &Status) -> SourceError {
    if status.code() == Code::Unavailable {
        return SourceError::unavailable(status.message().to_string());
    }
    classify_message(&format!("{:?}: {}", status.code(), status.message()))
}

/// Full error text including every source, since transport errors keep the
/// useful part ("connection refused") in their chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[async_trait]
impl StreamConnector for GrpcConnector {
    async fn open(&self, address: &str, channels: &[u32]) -> Result<ChunkStream, SourceError> {
        let channel = self
            .endpoint(address)?
            .connect()
            .await
            .map_err(|e| classify_message(&error_chain(&e)))?;

        let mut client = AcquisitionServiceClient::new(channel);
        let response = client
            .stream_chunks(ChannelsRequest {
                channels: channels.to_vec(),
            })
            .await
            .map_err(|status| classify_status(&status))?;
        debug!(address, channels = channels.len(), "StreamChunks accepted");

        let stream = response.into_inner().map(|item| {
            item.map(|chunk| chunk.data)
                .map_err(|status| SourceError::transient(format!("{:?}: {}", status.code(), status.message())))
        });
        Ok(Box::pin(stream))
    }
}
