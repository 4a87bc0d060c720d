#![cfg(feature = "transport-grpc")]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;

use chanrelay::transport::proto::relay_service_client::RelayServiceClient;
use chanrelay::transport::proto::{SubscribeRequest, WatchHealthRequest};
use chanrelay::transport::{FakeAcquisitionService, GrpcConnector, RelayServiceImpl};
use chanrelay::{
    ConsumerId, DeviceConfig, DeviceRegistry, RelayHub, SessionPhase, SessionTuning, SourceKind,
    SourceSession, StreamConnector,
};

async fn spawn_fake_device(svc: FakeAcquisitionService) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(svc.into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    addr
}

fn fast_tuning() -> SessionTuning {
    SessionTuning {
        chunk_interval_ms: 20,
        batch_size: 2,
        reconnect_delay_ms: 200,
        ..SessionTuning::default()
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_streams_from_fake_device() {
    let mut recording = vec![0.0_f32; 1_000];
    recording.extend(std::iter::repeat(2.5_f32).take(1_000));
    let fake = FakeAcquisitionService::new(0)
        .with_recording(recording.into(), 2)
        .with_period(Duration::from_millis(20));
    let addr = spawn_fake_device(fake).await;

    let device = DeviceConfig::new("mea-1", addr.to_string()).with_channels([0, 1]);
    let connector: Arc<dyn StreamConnector> = Arc::new(GrpcConnector::new());
    let session = SourceSession::new(device, fast_tuning(), connector).unwrap();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    session
        .subscribe("c1", vec![1], move |_: &ConsumerId, batch: Vec<f32>| {
            sink.lock().unwrap().push(batch);
        })
        .unwrap();

    session.start().unwrap();
    assert!(wait_for(|| !batches.lock().unwrap().is_empty()).await);

    assert_eq!(session.phase(), SessionPhase::StreamingRemote);
    assert_eq!(session.active_source(), Some(SourceKind::Remote));
    let first = batches.lock().unwrap()[0].clone();
    assert_eq!(first.len(), 2 * 160);
    assert!(first.iter().all(|&v| v == 2.5));
    session.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_device_falls_back_to_synthetic() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let device = DeviceConfig::new("mea-1", addr.to_string()).with_channels(0..4);
    let connector: Arc<dyn StreamConnector> = Arc::new(GrpcConnector::new());
    let session = SourceSession::new(device, fast_tuning(), connector).unwrap();

    session.start().unwrap();
    assert!(wait_for(|| session.phase() == SessionPhase::StreamingSynthetic).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!session.reconnect_pending());
    assert_eq!(session.stats().reconnects_scheduled, 0);
    assert!(session.stats().chunks_delivered > 0);
    session.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_service_serves_consumers_end_to_end() {
    let fake = FakeAcquisitionService::new(0).with_period(Duration::from_millis(20));
    let device_addr = spawn_fake_device(fake).await;

    let registry = DeviceRegistry::new(vec![
        DeviceConfig::new("mea-1", device_addr.to_string()).with_channels(0..4),
    ])
    .unwrap();
    let hub = Arc::new(
        RelayHub::from_registry(&registry, fast_tuning(), Arc::new(GrpcConnector::new())).unwrap(),
    );
    hub.start_all().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let svc = RelayServiceImpl::new(Arc::clone(&hub)).into_server();
    tokio::spawn(async move {
        Server::builder()
            .add_service(svc)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let mut client = RelayServiceClient::connect(format!("http://{relay_addr}")).await.unwrap();
    let mut batches = client
        .subscribe(SubscribeRequest {
            device_id: "mea-1".into(),
            channel_positions: vec![3, 0],
        })
        .await
        .unwrap()
        .into_inner();

    let batch = tokio::time::timeout(Duration::from_secs(5), batches.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(batch.device_id, "mea-1");
    assert_eq!(batch.data.len(), 2 * 2 * 160);

    let session = hub.get("mea-1").unwrap().clone();
    assert_eq!(session.listener_count(), 1);
    drop(batches);
    assert!(wait_for(|| session.listener_count() == 0).await, "closing the stream unsubscribes");

    let err = client
        .subscribe(SubscribeRequest {
            device_id: "nope".into(),
            channel_positions: vec![],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);

    let err = client
        .watch_health(WatchHealthRequest {
            device_id: "nope".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);

    hub.stop_all();
}
