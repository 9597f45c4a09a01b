//! Configuration module for tunrelay
//!
//! Configuration is JSON, supplied fresh at every tunnel start. Nothing is
//! persisted by the core.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Metrics API configuration
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Virtual interface as provisioned by the host
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Upstream proxy endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Routing policy
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Session table tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Transport multiplexer tuning
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bound on draining in-flight work when the tunnel stops
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the metrics endpoint (e.g., "127.0.0.1:9090")
    pub listen: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the routing compiler
    pub fn validate(&self) -> Result<()> {
        if self.interface.mtu < 576 || self.interface.mtu > 65535 {
            return Err(Error::Config(format!(
                "MTU {} out of range (576-65535)",
                self.interface.mtu
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.is_empty() {
                return Err(Error::Config("Endpoint id must not be empty".into()));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(Error::Config(format!("Duplicate endpoint id: {}", endpoint.id)));
            }
            if endpoint.address.is_empty() {
                return Err(Error::Config(format!("Endpoint [{}] has no address", endpoint.id)));
            }
        }
        if self.transport.max_consecutive_failures == 0 {
            return Err(Error::Config("max_consecutive_failures must be at least 1".into()));
        }
        Ok(())
    }

    /// Create a default client configuration: everything proxied through a
    /// single endpoint, private ranges sent directly.
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            api: None,
            interface: InterfaceConfig::default(),
            endpoints: vec![EndpointConfig {
                id: "main".to_string(),
                address: "vpn.example.com".to_string(),
                port: default_endpoint_port(),
                tls: Some(TlsSettings {
                    server_name: Some("vpn.example.com".to_string()),
                    allow_insecure: false,
                    alpn: vec![],
                }),
                credentials: Credentials {
                    method: "aes-256-gcm".to_string(),
                    password: "change-me".to_string(),
                },
            }],
            routing: RoutingConfig {
                default_action: "proxy".to_string(),
                default_endpoint: Some("main".to_string()),
                rules: vec![RuleConfig {
                    rule_type: "private".to_string(),
                    action: "direct".to_string(),
                    ..Default::default()
                }],
            },
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log: LogConfig::default(),
            api: None,
            interface: InterfaceConfig::default(),
            endpoints: vec![],
            routing: RoutingConfig::default(),
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Virtual interface settings.
///
/// The host provisions the interface; the core only needs the address and
/// MTU to validate packets, and hands the rest back to the host on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Address assigned to the virtual interface
    #[serde(default = "default_interface_address")]
    pub address: Ipv4Addr,

    /// Prefix length of the assigned address
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// MTU of the virtual interface
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// DNS servers the host should configure on the interface
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    /// Routes the host should send into the interface
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,

    /// Session name shown by the platform
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_interface_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_prefix_len() -> u8 {
    32
}

fn default_mtu() -> usize {
    1500
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

fn default_routes() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_session_name() -> String {
    "tunrelay".to_string()
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            address: default_interface_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            dns_servers: default_dns_servers(),
            routes: default_routes(),
            session_name: default_session_name(),
        }
    }
}

/// Upstream endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique id referenced by PROXY routing actions
    pub id: String,

    /// Server host name or IP literal
    pub address: String,

    /// Server port
    #[serde(default = "default_endpoint_port")]
    pub port: u16,

    /// TLS settings; plain TCP when absent
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Credentials presented when the link is established
    #[serde(default)]
    pub credentials: Credentials,
}

fn default_endpoint_port() -> u16 {
    443
}

/// TLS settings for an upstream link
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Server name for SNI, defaults to the endpoint host
    #[serde(default)]
    pub server_name: Option<String>,

    /// Skip certificate verification
    #[serde(default)]
    pub allow_insecure: bool,

    /// ALPN protocols
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// Transport credentials, opaque to the router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Encryption method name
    #[serde(default)]
    pub method: String,

    /// Shared secret
    #[serde(default)]
    pub password: String,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Action when no rule matches: direct, proxy or block
    #[serde(default = "default_action")]
    pub default_action: String,

    /// Endpoint used by `proxy` actions that do not name one
    #[serde(default)]
    pub default_endpoint: Option<String>,

    /// Rules, evaluated in order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_action() -> String {
    "direct".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_action: default_action(),
            default_endpoint: None,
            rules: vec![],
        }
    }
}

/// Routing rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule type: field, private, all
    #[serde(rename = "type", default = "default_rule_type")]
    pub rule_type: String,

    /// Optional name used in logs and metrics
    #[serde(default)]
    pub tag: Option<String>,

    /// Destination CIDRs or IP literals
    #[serde(default)]
    pub ip: Vec<String>,

    /// Domain patterns (domain:, full:, keyword:, regexp:)
    #[serde(default)]
    pub domain: Vec<String>,

    /// Port patterns (e.g., "53", "80,443", "1000-2000")
    #[serde(default)]
    pub port: Option<String>,

    /// Network restriction: "tcp", "udp" or "tcp,udp"
    #[serde(default)]
    pub network: Option<String>,

    /// Action: direct, proxy, block
    pub action: String,

    /// Endpoint for proxy actions
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_rule_type() -> String {
    "field".to_string()
}

/// Session table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// UDP sessions are evicted after this much inactivity
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// TCP sessions are evicted after this much inactivity
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,

    /// Grace period for a closing TCP session before it is removed
    #[serde(default = "default_tcp_close_grace_secs")]
    pub tcp_close_grace_secs: u64,

    /// Interval between idle sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_udp_idle_timeout_secs() -> u64 {
    30
}

fn default_tcp_idle_timeout_secs() -> u64 {
    300
}

fn default_tcp_close_grace_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_max_sessions() -> usize {
    65536
}

impl SessionConfig {
    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    pub fn tcp_close_grace(&self) -> Duration {
        Duration::from_secs(self.tcp_close_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
            tcp_close_grace_secs: default_tcp_close_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Transport multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Consecutive send failures before a session is reported failed
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Reconnect attempts per outage before the link gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First reconnect delay
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Upper bound on the reconnect delay
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Dial timeout for upstream and direct TCP connections
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-link outbound queue depth, in packets
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    200
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_queue_depth() -> usize {
    1024
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(config.interface.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.interface.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(config.session.udp_idle_timeout_secs, 30);
        assert_eq!(config.transport.max_consecutive_failures, 5);
        assert_eq!(config.routing.default_action, "direct");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "interface": { "address": "10.8.0.2", "mtu": 1400 },
            "endpoints": [{
                "id": "hk",
                "address": "203.0.113.10",
                "port": 8443,
                "credentials": { "method": "chacha20-poly1305", "password": "secret" }
            }],
            "routing": {
                "default_action": "proxy",
                "default_endpoint": "hk",
                "rules": [
                    { "type": "private", "action": "direct" },
                    { "domain": ["domain:ads.example"], "action": "block" },
                    { "ip": ["1.1.1.0/24"], "port": "53", "network": "udp", "action": "proxy", "endpoint": "hk" }
                ]
            },
            "session": { "udp_idle_timeout_secs": 45 }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.interface.mtu, 1400);
        assert_eq!(config.endpoints[0].port, 8443);
        assert_eq!(config.endpoints[0].credentials.password, "secret");
        assert!(config.endpoints[0].tls.is_none());
        assert_eq!(config.routing.rules.len(), 3);
        assert_eq!(config.routing.rules[0].rule_type, "private");
        assert_eq!(config.routing.rules[2].port.as_deref(), Some("53"));
        assert_eq!(config.session.udp_idle_timeout(), Duration::from_secs(45));
        assert_eq!(config.session.tcp_idle_timeout_secs, 300);
    }

    #[test]
    fn test_validation() {
        assert!(Config::from_json(r#"{ "interface": { "mtu": 100 } }"#).is_err());
        assert!(Config::from_json(
            r#"{ "endpoints": [
                { "id": "a", "address": "x.example" },
                { "id": "a", "address": "y.example" }
            ] }"#
        )
        .is_err());
        assert!(Config::from_json("not json").is_err());
    }

    #[test]
    fn test_default_client_round_trips() {
        let config = Config::default_client();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.endpoints[0].id, "main");
        assert_eq!(parsed.routing.default_endpoint.as_deref(), Some("main"));
    }
}
