//! TCP Transport implementation

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::Transport;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport - raw TCP connections
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dial and return the concrete stream
    pub async fn dial(&self, addr: &Address) -> Result<TcpStream> {
        let connect = async {
            match addr {
                Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
                Address::Domain(domain, port) => {
                    TcpStream::connect((domain.as_str(), *port)).await
                }
            }
        };
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("connect {} failed: {}", addr, e)))?;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok(stream)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        Ok(self.dial(addr).await?.into_stream())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
