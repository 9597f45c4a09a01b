//! Transport Layer
//!
//! Responsibilities:
//! - Establish connections to upstream endpoints (TCP, TLS over TCP)
//! - NO framing, NO session handling
//!
//! This layer ONLY deals with getting a byte stream to an endpoint. The
//! multiplexer above it owns framing and reconnects.

mod backoff;
mod tcp;
mod tls;

pub use backoff::Backoff;
pub use tcp::TcpTransport;
pub use tls::{TlsConfig, TlsTransport};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};
use crate::config::EndpointConfig;

/// Transport trait for establishing upstream connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Build the transport an endpoint is reached through
pub fn for_endpoint(endpoint: &EndpointConfig, connect_timeout: Duration) -> Arc<dyn Transport> {
    let tcp = TcpTransport::new().with_timeout(connect_timeout);
    match &endpoint.tls {
        Some(tls) => {
            let config = TlsConfig {
                server_name: tls
                    .server_name
                    .clone()
                    .or_else(|| Some(endpoint.address.clone())),
                allow_insecure: tls.allow_insecure,
                alpn: tls.alpn.clone(),
            };
            Arc::new(TlsTransport::new(tcp, config))
        }
        None => Arc::new(tcp),
    }
}
