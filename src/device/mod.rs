//! Virtual interface
//!
//! Responsibilities:
//! - Read raw IP packets the host routes into the tunnel
//! - Write raw IP packets back to the host
//!
//! The host provisions the interface (address, routes, DNS) and hands the
//! core a packet device. One `read` returns one packet; one `write` sends
//! one packet.

mod channel;
#[cfg(unix)]
mod fd;

pub use channel::{ChannelDevice, DeviceHandle};
#[cfg(unix)]
pub use fd::FdDevice;

use std::io;

use async_trait::async_trait;

/// Packet device the tunnel runs on
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read one packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn write(&self, packet: &[u8]) -> io::Result<()>;

    /// Release the device. Pending and later reads fail.
    async fn close(&self);

    /// Short name for logs
    fn name(&self) -> &str;
}
