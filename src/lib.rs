//! Tunrelay - packet router and transport multiplexer for mobile VPN tunnels
//!
//! # Architecture
//!
//! ```text
//! Virtual interface (tun fd / channel)
//! → Packet codec (parse)
//! → Route table (direct / proxy / block)
//! → Session table (one session per flow)
//! → Transport multiplexer (direct sockets / upstream links)
//! → network, and back the same way
//! ```
//!
//! ## Core Principles
//!
//! - The device loop never blocks on the network
//! - Every seam is a trait: device, multiplexer, transport
//! - Only device failures end the tunnel
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: FlowKey, Address, Stream
//! ├── packet/          # IPv4/IPv6 + TCP/UDP codec
//! ├── route/           # Rule compilation, resolution, DNS reverse cache
//! ├── session/         # Flow → session table, idle sweeping
//! ├── transport/       # TCP and TLS dialers, reconnect backoff
//! ├── mux/             # Direct and upstream multiplexers
//! ├── device/          # Virtual interface implementations
//! └── app/             # Tunnel router, controller, stats
//! ```

// Core types
pub mod common;
pub mod error;

// Data path
pub mod packet;
pub mod route;
pub mod session;
pub mod transport;
pub mod mux;
pub mod device;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, FlowKey, IpProtocol, Stream};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::{TunnelController, TunnelRouter};
pub use device::VirtualInterface;
pub use mux::Multiplexer;
pub use route::RouteTable;
pub use session::SessionTable;
pub use transport::Transport;
