//! Fake acquisition devices
//!
//! Serves `StreamChunks` on consecutive ports, one instance per port, so the
//! relay can run end to end without hardware.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinSet;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chanrelay::config::{check_port_range, DEFAULT_CHANNEL_COUNT, DEFAULT_REPLAY_CHANNELS};
use chanrelay::source::read_recording;
use chanrelay::transport::FakeAcquisitionService;
use chanrelay::TransportError;

struct Config {
    host: [u8; 4],
    base_port: u16,
    count: u16,
    replay: Option<PathBuf>,
    replay_channels: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: [127, 0, 0, 1],
            base_port: 5051,
            count: 4,
            replay: Some(PathBuf::from("wavelet_signal.bin")),
            replay_channels: DEFAULT_REPLAY_CHANNELS,
        }
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    if i + 1 < args.len() {
        args[i + 1].clone()
    } else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("error: invalid {what}: {value}");
        std::process::exit(1);
    })
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-port" | "-p" => {
                config.base_port = parse_number(&value_of(&args, i, "--base-port"), "port number");
                i += 2;
            }
            "--count" | "-n" => {
                config.count = parse_number(&value_of(&args, i, "--count"), "instance count");
                i += 2;
            }
            "--replay" | "-r" => {
                config.replay = Some(PathBuf::from(value_of(&args, i, "--replay")));
                i += 2;
            }
            "--no-replay" => {
                config.replay = None;
                i += 1;
            }
            "--replay-channels" => {
                config.replay_channels = parse_number(&value_of(&args, i, "--replay-channels"), "channel count");
                i += 2;
            }
            "--public" => {
                config.host = [0, 0, 0, 0];
                i += 1;
            }
            "--help" | "-h" => {
                println!("chanrelay-fake-device - fake acquisition devices");
                println!();
                println!("USAGE:");
                println!("    chanrelay-fake-device [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --base-port <PORT>       First port [default: 5051]");
                println!("    -n, --count <N>              Number of instances [default: 4]");
                println!("    -r, --replay <FILE>          Recording to replay [default: wavelet_signal.bin]");
                println!("        --no-replay              Serve Gaussian noise only");
                println!("        --replay-channels <N>    Channels in the recording [default: 128]");
                println!("        --public                 Listen on 0.0.0.0");
                println!("    -h, --help                   Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    if let Err(err) = check_port_range(config.base_port, config.count) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chanrelay=info,chanrelay_fake_device=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = parse_args();

    let recording: Option<Arc<[f32]>> = match &config.replay {
        Some(path) => match read_recording(path).await {
            Ok(samples) => {
                info!(path = %path.display(), samples = samples.len(), channels = config.replay_channels, "loaded recording");
                Some(samples)
            }
            Err(err) => {
                warn!(error = %err, "recording not available, all instances serve Gaussian noise");
                None
            }
        },
        None => None,
    };

    let mut servers = JoinSet::new();
    for (i, port) in (0..config.count).zip(config.base_port..=u16::MAX) {
        let addr = SocketAddr::from((config.host, port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

        let base_channel = u32::from(i) * DEFAULT_CHANNEL_COUNT;
        let mut svc = FakeAcquisitionService::new(base_channel);
        if let Some(samples) = &recording {
            svc = svc.with_recording(Arc::clone(samples), config.replay_channels);
        }
        info!(%addr, instance = i, base_channel, offset = svc.start_offset(), "fake device listening");

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        servers.spawn(async move {
            Server::builder()
                .add_service(svc.into_server())
                .serve_with_incoming(incoming)
                .await
                .map_err(|e| TransportError::Serve { message: e.to_string() })
        });
    }

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutting down"),
        Some(result) = servers.join_next() => {
            match result {
                Ok(Err(err)) => error!(error = %err, "fake device stopped"),
                Err(err) => error!(error = %err, "fake device task failed"),
                Ok(Ok(())) => {}
            }
        }
    }
    servers.shutdown().await;
    Ok(())
}
