use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};

use crate::chunk::Chunk;
use crate::error::SourceError;

/// Raw chunk payloads of an accepted remote call.
///
/// Items after acceptance are mid-stream results: connectors report their
/// failures as [`SourceError::Transient`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<f32>, SourceError>> + Send>>;

/// Capability to open the server-streaming call of a device.
///
/// Sessions receive an already constructed connector; they never load wire
/// schemas or build clients themselves.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Opens the call for `channels` on the device at `address`.
    ///
    /// Resolves once the call is accepted. Connect-time failures must be
    /// classified: [`SourceError::Unavailable`] when the endpoint could not be
    /// reached at all, [`SourceError::Transient`] otherwise.
    async fn open(&self, address: &str, channels: &[u32]) -> Result<ChunkStream, SourceError>;
}

/// Message fragments that mean the endpoint was never reached.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "unavailable",
    "connection refused",
    "failed to connect",
    "error trying to connect",
    "tcp connect error",
    "no route to host",
    "network is unreachable",
    "host is unreachable",
    "dns error",
    "failed to lookup address",
    "name or service not known",
];

/// Classifies a transport error by its text.
///
/// Transport libraries surface refused connections as generic errors, so the
/// message is the only reliable signal.
#[must_use]
pub fn classify_message(message: &str) -> SourceError {
    let lower = message.to_ascii_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        SourceError::unavailable(message)
    } else {
        SourceError::transient(message)
    }
}

/// An accepted remote streaming call.
pub struct RemoteStream {
    address: String,
    stream: ChunkStream,
}

impl RemoteStream {
    /// Opens the call through `connector`.
    pub async fn connect(
        connector: &dyn StreamConnector,
        address: &str,
        channels: &[u32],
    ) -> Result<Self, SourceError> {
        let stream = connector.open(address, channels).await?;
        Ok(Self {
            address: address.to_string(),
            stream,
        })
    }

    /// Address the stream was opened on.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next chunk from the device. The end of the stream is a transient failure.
    pub async fn next_chunk(&mut self) -> Result<Chunk, SourceError> {
        match self.stream.next().await {
            Some(Ok(samples)) => Ok(Chunk::from(samples)),
            Some(Err(err)) => Err(err),
            None => Err(SourceError::transient(format!(
                "stream from {} ended unexpectedly",
                self.address
            ))),
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedConnector {
        result: Result<Vec<Vec<f32>>, SourceError>,
    }

    #[async_trait]
    impl StreamConnector for FixedConnector {
        async fn open(&self, _address: &str, _channels: &[u32]) -> Result<ChunkStream, SourceError> {
            let items = self.result.clone()?;
            Ok(Box::pin(tokio_stream::iter(items.into_iter().map(Ok::<_, SourceError>))))
        }
    }

    #[test]
    fn test_classify_refused_as_unavailable() {
        let msg = "error trying to connect: tcp connect error: Connection refused (os error 111)";
        assert!(classify_message(msg).is_unavailable());
        assert!(classify_message("status: Unavailable, message: \"UNAVAILABLE\"").is_unavailable());
        assert!(classify_message("dns error: failed to lookup address information").is_unavailable());
    }

    #[test]
    fn test_classify_mid_stream_as_transient() {
        assert!(classify_message("h2 protocol error: stream reset").is_transient());
        assert!(classify_message("connection reset by peer").is_transient());
        assert!(classify_message("internal error").is_transient());
    }

    #[tokio::test]
    async fn test_remote_stream_yields_then_reports_end() {
        let connector = FixedConnector {
            result: Ok(vec![vec![1.0, 2.0], vec![3.0]]),
        };
        let mut remote = RemoteStream::connect(&connector, "localhost:5051", &[0]).await.unwrap();
        assert_eq!(remote.address(), "localhost:5051");
        assert_eq!(remote.next_chunk().await.unwrap().samples(), &[1.0, 2.0]);
        assert_eq!(remote.next_chunk().await.unwrap().samples(), &[3.0]);

        let err = remote.next_chunk().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_failure_is_passed_through() {
        let connector = FixedConnector {
            result: Err(SourceError::unavailable("connection refused")),
        };
        let err = RemoteStream::connect(&connector, "localhost:5051", &[0]).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
