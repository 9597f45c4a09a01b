//! Control bridge
//!
//! The surface a host application drives: start and stop the tunnel, query
//! status and traffic, and receive lifecycle events.
//!
//! ```text
//!   host ── start(config, device) ──▶ TunnelController ──spawn──▶ TunnelRouter::run
//!     ▲                                     │                            │
//!     └──────── TunnelEvent ◀── broadcast ──┴──────── exit reason ◀──────┘
//! ```
//!
//! Exactly one `Disconnected` event is emitted per started tunnel, whether
//! it was stopped by the host or ended by a device failure.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, InterfaceConfig, RoutingConfig};
use crate::device::VirtualInterface;
use crate::error::{Error, Result};

use super::metrics::format_speed;
use super::permission::PermissionSlot;
use super::stats_api::start_api_server;
use super::tunnel::TunnelRouter;

/// Reason reported when the host stopped the tunnel
pub const STOPPED_REASON: &str = "Stopped";
const EVENT_CAPACITY: usize = 16;

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Lifecycle notification for the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Connected,
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub connected: bool,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    /// Why the last tunnel ended
    pub reason: Option<String>,
}

/// Traffic totals with speeds since the previous query
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub upload_speed: String,
    pub download_speed: String,
    pub active_sessions: usize,
}

/// What the host must provision on the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSettings {
    pub session_name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub dns_servers: Vec<String>,
    pub routes: Vec<String>,
    pub mtu: usize,
}

impl From<&InterfaceConfig> for InterfaceSettings {
    fn from(config: &InterfaceConfig) -> Self {
        Self {
            session_name: config.session_name.clone(),
            address: config.address,
            prefix_len: config.prefix_len,
            dns_servers: config.dns_servers.clone(),
            routes: config.routes.clone(),
            mtu: config.mtu,
        }
    }
}

struct Sample {
    at: Instant,
    upload: u64,
    download: u64,
}

struct ControllerState {
    state: TunnelState,
    reason: Option<String>,
    generation: u64,
    router: Option<Arc<TunnelRouter>>,
    task: Option<JoinHandle<()>>,
    drain_timeout: Duration,
    settings: InterfaceSettings,
    last_totals: (u64, u64),
    sample: Sample,
}

/// Host-facing tunnel controller
pub struct TunnelController {
    inner: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<TunnelEvent>,
    permission: PermissionSlot,
}

impl TunnelController {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(ControllerState {
                state: TunnelState::Disconnected,
                reason: None,
                generation: 0,
                router: None,
                task: None,
                drain_timeout: Duration::from_secs(5),
                settings: InterfaceSettings::from(&InterfaceConfig::default()),
                last_totals: (0, 0),
                sample: Sample {
                    at: Instant::now(),
                    upload: 0,
                    download: 0,
                },
            })),
            events,
            permission: PermissionSlot::new(),
        }
    }

    /// Start a tunnel on `device` with a fresh configuration
    pub fn start(&self, config: Config, device: Arc<dyn VirtualInterface>) -> Result<()> {
        self.ensure_stopped()?;
        config.validate()?;
        let router = TunnelRouter::new(&config, device)?;
        self.launch(&config, router)
    }

    /// Start a tunnel over an already built router
    pub fn start_router(&self, config: &Config, router: TunnelRouter) -> Result<()> {
        self.ensure_stopped()?;
        self.launch(config, router)
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.inner.lock().state != TunnelState::Disconnected {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    fn launch(&self, config: &Config, router: TunnelRouter) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TunnelState::Disconnected {
            return Err(Error::AlreadyRunning);
        }
        inner.state = TunnelState::Connecting;
        inner.generation += 1;
        inner.reason = None;
        inner.settings = InterfaceSettings::from(&config.interface);
        inner.drain_timeout = config.shutdown_timeout();

        let api_tx = config.api.as_ref().and_then(|api| {
            match api.listen.parse::<SocketAddr>() {
                Ok(addr) => {
                    let (tx, rx) = broadcast::channel(1);
                    tokio::spawn(start_api_server(addr, rx));
                    Some(tx)
                }
                Err(e) => {
                    warn!("[Controller] Invalid api.listen {}: {}", api.listen, e);
                    None
                }
            }
        });

        let router = Arc::new(router);
        let task = tokio::spawn(monitor(
            self.inner.clone(),
            self.events.clone(),
            router.clone(),
            inner.generation,
            api_tx,
        ));

        inner.router = Some(router);
        inner.task = Some(task);
        inner.state = TunnelState::Connected;
        inner.sample = Sample {
            at: Instant::now(),
            upload: 0,
            download: 0,
        };
        // Sent under the lock so it always precedes the matching Disconnected
        let _ = self.events.send(TunnelEvent::Connected);
        info!("[Controller] Tunnel {} started", inner.generation);
        Ok(())
    }

    /// Stop the running tunnel and wait for it to wind down
    pub async fn stop(&self) -> Result<()> {
        let (router, task, drain_timeout, generation) = {
            let mut inner = self.inner.lock();
            let Some(task) = inner.task.take() else {
                return Err(Error::NotRunning);
            };
            inner.state = TunnelState::Disconnecting;
            (
                inner.router.clone(),
                task,
                inner.drain_timeout,
                inner.generation,
            )
        };
        if let Some(router) = router {
            router.shutdown();
        }

        let mut task = task;
        let deadline = drain_timeout + Duration::from_secs(1);
        if tokio::time::timeout(deadline, &mut task).await.is_err() {
            warn!("[Controller] Tunnel did not stop within {:?}, aborting", deadline);
            task.abort();
            let mut inner = self.inner.lock();
            if inner.generation == generation && inner.state == TunnelState::Disconnecting {
                finish(&mut inner, STOPPED_REASON.to_string());
                let _ = self.events.send(TunnelEvent::Disconnected {
                    reason: STOPPED_REASON.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn status(&self) -> TunnelStatus {
        let inner = self.inner.lock();
        let (upload_bytes, download_bytes) = totals(&inner);
        TunnelStatus {
            state: inner.state,
            connected: inner.state == TunnelState::Connected,
            upload_bytes,
            download_bytes,
            reason: inner.reason.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Totals plus speeds averaged since the previous call
    pub fn connection_stats(&self) -> ConnectionStats {
        let mut inner = self.inner.lock();
        let (upload, download) = totals(&inner);
        let active_sessions = inner
            .router
            .as_ref()
            .map(|router| router.sessions().len())
            .unwrap_or(0);

        let now = Instant::now();
        let secs = now.saturating_duration_since(inner.sample.at).as_secs_f64();
        let (up_speed, down_speed) = if secs > 0.0 {
            (
                upload.saturating_sub(inner.sample.upload) as f64 / secs,
                download.saturating_sub(inner.sample.download) as f64 / secs,
            )
        } else {
            (0.0, 0.0)
        };
        inner.sample = Sample {
            at: now,
            upload,
            download,
        };

        ConnectionStats {
            upload_bytes: upload,
            download_bytes: download,
            upload_speed: format_speed(up_speed),
            download_speed: format_speed(down_speed),
            active_sessions,
        }
    }

    /// Address, routes, DNS and MTU of the current (or last) tunnel
    pub fn interface_settings(&self) -> InterfaceSettings {
        self.inner.lock().settings.clone()
    }

    /// Swap the routing rules of the running tunnel
    pub fn reload_routes(&self, routing: &RoutingConfig) -> Result<u64> {
        let router = self.inner.lock().router.clone().ok_or(Error::NotRunning)?;
        router.routes().reload(routing)
    }

    pub fn permission(&self) -> &PermissionSlot {
        &self.permission
    }
}

impl Default for TunnelController {
    fn default() -> Self {
        Self::new()
    }
}

fn totals(inner: &ControllerState) -> (u64, u64) {
    match &inner.router {
        Some(router) => (router.stats().total_upload(), router.stats().total_download()),
        None => inner.last_totals,
    }
}

fn finish(inner: &mut ControllerState, reason: String) {
    inner.last_totals = totals(inner);
    inner.router = None;
    inner.task = None;
    inner.state = TunnelState::Disconnected;
    inner.reason = Some(reason);
}

async fn monitor(
    inner: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<TunnelEvent>,
    router: Arc<TunnelRouter>,
    generation: u64,
    api_tx: Option<broadcast::Sender<()>>,
) {
    let result = router.run().await;
    if let Some(tx) = api_tx {
        let _ = tx.send(());
    }

    let reason = match &result {
        Ok(()) => STOPPED_REASON.to_string(),
        Err(e) => {
            warn!("[Controller] Tunnel ended: {}", e);
            e.reason().to_string()
        }
    };

    let mut inner = inner.lock();
    if inner.generation == generation {
        finish(&mut inner, reason.clone());
    }
    info!("[Controller] Tunnel {} disconnected: {}", generation, reason);
    let _ = events.send(TunnelEvent::Disconnected { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelDevice;

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let controller = TunnelController::new();
        let mut events = controller.subscribe();
        let (device, handle) = ChannelDevice::pair(8);

        controller
            .start(Config::default_client(), Arc::new(device))
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), TunnelEvent::Connected);
        assert!(controller.status().connected);

        let (again, _h) = ChannelDevice::pair(8);
        assert!(matches!(
            controller.start(Config::default_client(), Arc::new(again)),
            Err(Error::AlreadyRunning)
        ));

        controller.stop().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Disconnected {
                reason: STOPPED_REASON.to_string()
            }
        );
        let status = controller.status();
        assert_eq!(status.state, TunnelState::Disconnected);
        assert_eq!(status.reason.as_deref(), Some(STOPPED_REASON));
        assert!(handle.is_closed());
        assert!(matches!(controller.stop().await, Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_controller_stopped() {
        let controller = TunnelController::new();
        let mut config = Config::default_client();
        config.interface.mtu = 100;
        let (device, _handle) = ChannelDevice::pair(8);
        assert!(controller.start(config, Arc::new(device)).is_err());
        assert_eq!(controller.status().state, TunnelState::Disconnected);
    }

    #[test]
    fn test_default_interface_settings() {
        let settings = TunnelController::new().interface_settings();
        assert_eq!(settings.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(settings.prefix_len, 32);
        assert_eq!(settings.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(settings.routes, vec!["0.0.0.0/0"]);
        assert_eq!(settings.mtu, 1500);
    }

    #[tokio::test]
    async fn test_connection_stats_idle() {
        let controller = TunnelController::new();
        let stats = controller.connection_stats();
        assert_eq!(stats.upload_bytes, 0);
        assert_eq!(stats.upload_speed, "0 B/s");
        assert_eq!(stats.active_sessions, 0);
    }
}
