use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::hub::RelayHub;
use crate::session::ConsumerId;

use super::proto::relay_service_server::{RelayService, RelayServiceServer};
use super::proto::{HealthEvent, SampleBatch, SubscribeRequest, WatchHealthRequest};

/// Batches buffered per consumer before new ones are dropped.
const SUBSCRIBER_BUFFER: usize = 32;

/// Buffered health events per watcher.
const HEALTH_BUFFER: usize = 128;

/// Poll interval of the blocking health forwarder.
const HEALTH_POLL: Duration = Duration::from_secs(1);

/// Relay service: one `Subscribe` stream per (consumer, device).
///
/// Closing the stream removes the subscription.
pub struct RelayServiceImpl {
    hub: Arc<RelayHub>,
}

impl RelayServiceImpl {
    /// Serves the sessions of `hub`.
    #[must_use]
    pub const fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    /// Wraps the service for `Server::add_service`.
    #[must_use]
    pub fn into_server(self) -> RelayServiceServer<Self> {
        RelayServiceServer::new(self)
    }
}

/// Maps relay errors onto gRPC status codes.
#[must_use]
pub fn status_from_relay_error(err: RelayError) -> Status {
    match err {
        RelayError::Config(e) => Status::invalid_argument(e.to_string()),
        RelayError::UnknownDevice { .. } => Status::not_found(err.to_string()),
        RelayError::Source(_) | RelayError::Transport(_) | RelayError::Disconnected { .. } => {
            Status::unavailable(err.to_string())
        }
        RelayError::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
        RelayError::Internal { message } => Status::internal(message),
    }
}

#[tonic::async_trait]
impl RelayService for RelayServiceImpl {
    type SubscribeStream = ReceiverStream<Result<SampleBatch, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let session = self.hub.get(&req.device_id).map_err(status_from_relay_error)?.clone();

        let positions: Vec<usize> = if req.channel_positions.is_empty() {
            (0..session.shape().channels).collect()
        } else {
            req.channel_positions.iter().map(|&p| p as usize).collect()
        };

        let consumer = ConsumerId::generate();
        let (tx, rx) = mpsc::channel::<Result<SampleBatch, Status>>(SUBSCRIBER_BUFFER);

        let emit_tx = tx.clone();
        let device_id = req.device_id.clone();
        session
            .subscribe(consumer.clone(), positions, move |id: &ConsumerId, data: Vec<f32>| {
                let batch = SampleBatch {
                    device_id: device_id.clone(),
                    consumer_id: id.to_string(),
                    data,
                };
                match emit_tx.try_send(Ok(batch)) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(device_id = %device_id, consumer = %id, "consumer is lagging, batch dropped");
                    }
                }
            })
            .map_err(|e| status_from_relay_error(e.into()))?;
        debug!(device_id = %req.device_id, consumer = %consumer, "subscribe stream opened");

        // The session keeps a sender alive, so watch the receiver instead.
        tokio::spawn(async move {
            tx.closed().await;
            session.unsubscribe(&consumer);
            debug!(device_id = %session.device_id(), consumer = %consumer, "subscribe stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type WatchHealthStream = ReceiverStream<Result<HealthEvent, Status>>;

    async fn watch_health(
        &self,
        request: Request<WatchHealthRequest>,
    ) -> Result<Response<Self::WatchHealthStream>, Status> {
        let req = request.into_inner();
        let device = (!req.device_id.is_empty()).then_some(req.device_id.as_str());
        let stream = self.hub.watch_health(device).map_err(status_from_relay_error)?;

        let (tx, rx) = mpsc::channel::<Result<HealthEvent, Status>>(HEALTH_BUFFER);
        tokio::task::spawn_blocking(move || loop {
            match stream.recv_timeout(HEALTH_POLL) {
                Ok(event) => {
                    let msg = HealthEvent {
                        device_id: event.device_id,
                        unhealthy: event.unhealthy,
                        at: event.at.to_rfc3339(),
                    };
                    if tx.blocking_send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Err(RelayError::Timeout { .. }) => {
                    // Check for client disconnect, otherwise keep polling.
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(status_from_relay_error(err)));
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_stream::StreamExt;

    use crate::config::{DeviceConfig, DeviceRegistry, MonitorConfig, SessionTuning};
    use crate::session::SessionPhase;
    use crate::error::{ConfigError, SourceError};
    use crate::source::{ChunkStream, StreamConnector};

    struct Refusing;

    #[async_trait]
    impl StreamConnector for Refusing {
        async fn open(&self, _address: &str, _channels: &[u32]) -> Result<ChunkStream, SourceError> {
            Err(SourceError::unavailable("connection refused"))
        }
    }

    type Feed = UnboundedSender<Result<Vec<f32>, SourceError>>;

    /// Accepts one call per address that has a feed; refuses the rest.
    #[derive(Default)]
    struct Feeds(Mutex<HashMap<String, UnboundedReceiverStream<Result<Vec<f32>, SourceError>>>>);

    impl Feeds {
        fn feed(&self, address: &str) -> Feed {
            let (tx, rx) = unbounded_channel();
            self.0.lock().unwrap().insert(address.to_string(), UnboundedReceiverStream::new(rx));
            tx
        }
    }

    #[async_trait]
    impl StreamConnector for Feeds {
        async fn open(&self, address: &str, _channels: &[u32]) -> Result<ChunkStream, SourceError> {
            let stream = self.0.lock().unwrap().remove(address);
            match stream {
                Some(stream) => Ok(Box::pin(stream)),
                None => Err(SourceError::unavailable("connection refused")),
            }
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn service(batch_size: usize) -> (RelayServiceImpl, Arc<RelayHub>) {
        let registry = DeviceRegistry::new(vec![DeviceConfig::new("sim-0", "localhost:5051").with_channels(0..4)]).unwrap();
        let tuning = SessionTuning {
            batch_size,
            ..SessionTuning::default()
        };
        let hub = Arc::new(RelayHub::from_registry(&registry, tuning, Arc::new(Refusing)).unwrap());
        (RelayServiceImpl::new(Arc::clone(&hub)), hub)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from_relay_error(RelayError::UnknownDevice { id: "x".into() }).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            status_from_relay_error(RelayError::Config(ConfigError::EmptyDeviceId)).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            status_from_relay_error(RelayError::Timeout { duration_ms: 1 }).code(),
            tonic::Code::DeadlineExceeded
        );
    }

    #[tokio::test]
    async fn test_subscribe_unknown_device_is_not_found() {
        let (svc, _hub) = service(1);
        let err = svc
            .subscribe(Request::new(SubscribeRequest {
                device_id: "nope".into(),
                channel_positions: vec![0],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_subscribe_bad_position_is_invalid_argument() {
        let (svc, _hub) = service(1);
        let err = svc
            .subscribe(Request::new(SubscribeRequest {
                device_id: "sim-0".into(),
                channel_positions: vec![9],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_health_streams_transitions() {
        let feeds = Arc::new(Feeds::default());
        let feed = feeds.feed("localhost:5051");
        let registry = DeviceRegistry::new(vec![DeviceConfig::new("sim-0", "localhost:5051").with_channels(0..2)]).unwrap();
        let tuning = SessionTuning {
            monitor: MonitorConfig {
                amplitude_threshold: 50.0,
                enter_threshold: 100,
                exit_threshold: 10,
            },
            ..SessionTuning::default()
        };
        let hub = Arc::new(RelayHub::from_registry(&registry, tuning, feeds).unwrap());
        let svc = RelayServiceImpl::new(Arc::clone(&hub));
        hub.start_all().unwrap();
        let session = hub.get("sim-0").unwrap().clone();
        assert!(wait_for(|| session.phase() == SessionPhase::StreamingRemote).await);

        let mut events = svc
            .watch_health(Request::new(WatchHealthRequest { device_id: String::new() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(session.status().health_listeners, 1);

        feed.send(Ok(vec![100.0; 320])).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.device_id, "sim-0");
        assert!(event.unhealthy);
        assert!(chrono::DateTime::parse_from_rfc3339(&event.at).is_ok());

        feed.send(Ok(vec![0.0; 320])).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!event.unhealthy);

        drop(events);
        assert!(
            wait_for(|| session.status().health_listeners == 0).await,
            "closing the RPC releases the health stream"
        );
        hub.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_streams_batches_and_unsubscribes_on_close() {
        let (svc, hub) = service(2);
        hub.start_all().unwrap();

        let mut stream = svc
            .subscribe(Request::new(SubscribeRequest {
                device_id: "sim-0".into(),
                channel_positions: vec![3, 1],
            }))
            .await
            .unwrap()
            .into_inner();
        let session = hub.get("sim-0").unwrap().clone();
        assert_eq!(session.listener_count(), 1);

        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.device_id, "sim-0");
        assert_eq!(batch.data.len(), 2 * 2 * 160);

        drop(stream);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.listener_count(), 0);
        hub.stop_all();
    }
}
