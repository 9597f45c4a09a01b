//! TLS over TCP for upstream links

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::{TcpTransport, Transport};

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI, defaults to the dialed host
    pub server_name: Option<String>,
    /// Allow insecure certificates
    pub allow_insecure: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
}

/// TCP transport with a TLS client handshake on top
pub struct TlsTransport {
    tcp: TcpTransport,
    config: TlsConfig,
    connector: TlsConnector,
}

impl TlsTransport {
    pub fn new(tcp: TcpTransport, config: TlsConfig) -> Self {
        let connector = Self::build_connector(&config);
        Self {
            tcp,
            config,
            connector,
        }
    }

    fn build_connector(config: &TlsConfig) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !config.alpn.is_empty() {
            tls_config.alpn_protocols = config
                .alpn
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect();
        }

        if config.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        TlsConnector::from(Arc::new(tls_config))
    }

    fn server_name(&self, addr: &Address) -> Result<ServerName<'static>> {
        let name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| addr.host());
        ServerName::try_from(name.clone())
            .map_err(|_| Error::Config(format!("Invalid server name: {}", name)))
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        let domain = self.server_name(addr)?;
        let tcp = self.tcp.dial(addr).await?;
        let tls_stream = self
            .connector
            .connect(domain, tcp)
            .await
            .map_err(|e| Error::Transport(format!("TLS handshake with {} failed: {}", addr, e)))?;
        debug!("[TLS] Handshake with {} complete", addr);
        Ok(tls_stream.into_stream())
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

/// Certificate verifier that accepts anything, for `allow_insecure`
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_falls_back_to_host() {
        let transport = TlsTransport::new(TcpTransport::new(), TlsConfig::default());
        let addr = Address::from_host("vpn.example.com", 443);
        assert!(transport.server_name(&addr).is_ok());

        let ip = Address::from_host("203.0.113.1", 443);
        assert!(transport.server_name(&ip).is_ok());

        let bad = TlsTransport::new(
            TcpTransport::new(),
            TlsConfig {
                server_name: Some("not a name!".into()),
                ..Default::default()
            },
        );
        assert!(bad.server_name(&addr).is_err());
    }
}
