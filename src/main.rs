//! Tunrelay - tun packet router for mobile VPN clients

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tunrelay::app::{TunnelController, TunnelEvent};
use tunrelay::config::Config;
use tunrelay::device::VirtualInterface;
use tunrelay::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::default_client())
            .map_err(|e| Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default_client(),
    };

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| config.log.level.clone())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using default client config");
    }

    let Some(fd) = args.fd else {
        eprintln!("No tun descriptor given. Pass the interface fd with --fd <N>.");
        std::process::exit(2);
    };

    info!("Tunrelay v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let device = open_device(fd)?;
        run(config, device).await
    })?;

    info!("Goodbye!");
    Ok(())
}

#[cfg(unix)]
fn open_device(fd: i32) -> Result<Arc<dyn VirtualInterface>> {
    // SAFETY: the host hands the descriptor over to this process for its
    // whole lifetime and does not close it itself
    let device = unsafe { tunrelay::device::FdDevice::from_raw_fd(fd) }
        .map_err(|e| Error::VirtualInterface(e.to_string()))?;
    Ok(Arc::new(device))
}

#[cfg(not(unix))]
fn open_device(_fd: i32) -> Result<Arc<dyn VirtualInterface>> {
    Err(Error::VirtualInterface(
        "tun descriptors are only supported on unix".into(),
    ))
}

async fn run(config: Config, device: Arc<dyn VirtualInterface>) -> Result<()> {
    let controller = TunnelController::new();
    let mut events = controller.subscribe();

    let settings = config.interface.clone();
    controller.start(config, device)?;
    info!(
        "Interface {}/{} mtu {} dns {:?}",
        settings.address, settings.prefix_len, settings.mtu, settings.dns_servers
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping tunnel");
                controller.stop().await?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::Connected) => info!("Tunnel connected"),
                Ok(TunnelEvent::Disconnected { reason }) => {
                    warn!("Tunnel disconnected: {}", reason);
                    return Ok(());
                }
                Err(_) => return Ok(()),
            }
        }
    }
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    fd: Option<i32>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut fd = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--fd" => {
                    if i + 1 < args.len() {
                        fd = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            fd,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(r#"Tunrelay - tun packet router for mobile VPN clients

USAGE:
    tunrelay [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --fd <N>                Tun interface file descriptor provided by the host
    --gen-config            Print an example client config
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tunrelay -c config.json --fd 3
    tunrelay --gen-config > client.json

METRICS:
    Set "api": {{"listen": "127.0.0.1:9090"}} in the config to serve
    GET /metrics             Prometheus metrics
"#);
}

fn print_version() {
    println!("Tunrelay v{}", env!("CARGO_PKG_VERSION"));
    println!("Packet router and transport multiplexer for tun interfaces");
}
