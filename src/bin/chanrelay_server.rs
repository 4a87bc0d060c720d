//! chanrelay gRPC server
//!
//! Runs one session per configured device and serves the relay service to
//! consumers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chanrelay::config::check_port_range;
use chanrelay::transport::{GrpcConnector, RelayServiceImpl};
use chanrelay::{DeviceRegistry, RelayConfig, RelayHub, TransportError};

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Device/tuning document; simulated devices when absent
    config_path: Option<PathBuf>,
    /// Number of simulated devices
    devices: u16,
    /// First port of the simulated devices
    device_base_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            config_path: None,
            devices: 4,
            device_base_port: 5051,
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

    if let Ok(path) = std::env::var("CHANRELAY_CONFIG") {
        config.config_path = Some(PathBuf::from(path));
    }
    if let Ok(addr) = std::env::var("CHANRELAY_ADDR") {
        config.addr = parse_number(&addr, "CHANRELAY_ADDR");
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let port: u16 = parse_number(&value_of(&args, i, "--port"), "port number");
                config.addr.set_port(port);
                i += 2;
            }
            "--addr" | "-a" => {
                config.addr = parse_number(&value_of(&args, i, "--addr"), "address");
                i += 2;
            }
            "--config" | "-c" => {
                config.config_path = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 2;
            }
            "--devices" | "-n" => {
                config.devices = parse_number(&value_of(&args, i, "--devices"), "device count");
                i += 2;
            }
            "--device-base-port" => {
                config.device_base_port = parse_number(&value_of(&args, i, "--device-base-port"), "port number");
                i += 2;
            }
            "--help" | "-h" => {
                println!("chanrelay-server - telemetry relay");
                println!();
                println!("USAGE:");
                println!("    chanrelay-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -a, --addr <ADDR>              Address to listen on [default: 127.0.0.1:50061]");
                println!("    -p, --port <PORT>              Port to listen on");
                println!("    -c, --config <FILE>            JSON device configuration");
                println!("    -n, --devices <N>              Simulated devices without --config [default: 4]");
                println!("        --device-base-port <PORT>  First simulated device port [default: 5051]");
                println!("    -h, --help                     Print help information");
                println!();
                println!("ENVIRONMENT:");
                println!("    CHANRELAY_CONFIG, CHANRELAY_ADDR, RUST_LOG");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    if config.config_path.is_none() {
        if let Err(err) = check_port_range(config.device_base_port, config.devices) {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chanrelay=info,chanrelay_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = parse_args();

    let relay_config = match &config.config_path {
        Some(path) => {
            info!(path = %path.display(), "loading device configuration");
            RelayConfig::load(path)?
        }
        None => {
            warn!(devices = config.devices, base_port = config.device_base_port, "no configuration given, using simulated devices");
            RelayConfig::simulated(config.devices, config.device_base_port)?
        }
    };
    relay_config.validate()?;

    let registry = DeviceRegistry::try_from(&relay_config)?;
    let hub = Arc::new(RelayHub::from_registry(
        &registry,
        relay_config.tuning.clone(),
        Arc::new(GrpcConnector::new()),
    )?);
    hub.start_all()?;

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| TransportError::BindFailed {
            addr: config.addr.to_string(),
            message: e.to_string(),
        })?;
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

    info!(addr = %config.addr, devices = hub.len(), "relay service listening");
    let svc = RelayServiceImpl::new(Arc::clone(&hub)).into_server();
    let served = Server::builder()
        .add_service(svc)
        .serve_with_incoming_shutdown(incoming, async {
            let _ = signal::ctrl_c().await;
        })
        .await
        .map_err(|e| TransportError::Serve { message: e.to_string() });

    hub.stop_all();
    for status in hub.statuses() {
        info!(
            device_id = %status.device_id,
            delivered = status.stats.chunks_delivered,
            dropped = status.stats.chunks_dropped,
            reconnects = status.stats.reconnects_scheduled,
            "final session stats"
        );
    }
    served?;
    info!("shut down");
    Ok(())
}
