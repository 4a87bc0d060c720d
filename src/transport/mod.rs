//! gRPC transport for chanrelay.
//!
//! Three services share one schema (`proto/chanrelay.proto`):
//! the device client that sessions use as their [`StreamConnector`], the
//! consumer-facing relay service, and a fake acquisition device for
//! development without hardware.
//!
//! [`StreamConnector`]: crate::source::StreamConnector

/// Device-side client.
pub mod device;
/// Fake acquisition device.
pub mod fake;
/// Consumer-facing relay service.
pub mod relay;

/// Generated protobuf and tonic code.
#[allow(missing_docs, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("chanrelay.v1");
}

pub use device::{classify_status, GrpcConnector};
pub use fake::FakeAcquisitionService;
pub use relay::{status_from_relay_error, RelayServiceImpl};
