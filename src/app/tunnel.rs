//! Tunnel Router
//!
//! Responsibilities:
//! - Read packets from the virtual interface and route each one
//! - Keep one session per flow and forward through the right multiplexer
//! - Write return traffic back to the interface
//! - Evict idle sessions and shut everything down on a device failure
//!
//! ```text
//!                       ┌──────────── RouteTable
//!                       ▼
//!   device ──▶ device loop ──▶ SessionTable ──▶ DirectMux / UpstreamMux ──▶ network
//!     ▲                                                  │
//!     └────────────────── network loop (per mux) ◀───────┘
//! ```
//!
//! All loops run as independent tasks. Per-packet and per-session errors are
//! counted and logged; only device I/O errors end the tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::common::{Direction, IpProtocol};
use crate::config::Config;
use crate::device::VirtualInterface;
use crate::error::{Error, Result};
use crate::mux::direct::DirectSettings;
use crate::mux::{Delivery, DirectMux, Multiplexer, UpstreamMux};
use crate::packet::{self, ParsedPacket};
use crate::route::{Action, Destination, DnsCache, RouteTable};
use crate::session::{opens_session, Session, SessionId, SessionLimits, SessionTable};

use super::metrics::{
    ROUTER_DECISIONS_TOTAL, ROUTER_RULE_HITS, TRANSPORT_SEND_FAILURES, TRANSPORT_SESSIONS_FAILED,
};
use super::stats::{DropReason, StatsCollector};

/// Large enough for any IP packet; anything above the MTU is dropped
const READ_BUFFER: usize = 65535;
const DNS_PORT: u16 = 53;

/// Routes packets between the virtual interface and the multiplexers
pub struct TunnelRouter {
    device: Arc<dyn VirtualInterface>,
    routes: Arc<RouteTable>,
    sessions: Arc<SessionTable>,
    stats: Arc<StatsCollector>,
    dns: Arc<DnsCache>,
    direct: Arc<dyn Multiplexer>,
    upstream: Arc<dyn Multiplexer>,
    failures: DashMap<SessionId, u32>,
    max_failures: u32,
    mtu: usize,
    sweep_interval: Duration,
    drain_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    fatal: Mutex<Option<Error>>,
}

impl TunnelRouter {
    /// Build a router with the default direct and upstream multiplexers
    pub fn new(config: &Config, device: Arc<dyn VirtualInterface>) -> Result<Self> {
        let direct = Arc::new(DirectMux::new(DirectSettings::new(
            config.interface.mtu,
            &config.transport,
        )));
        let upstream = Arc::new(UpstreamMux::new(&config.endpoints, &config.transport));
        Self::with_multiplexers(config, device, direct, upstream)
    }

    /// Build a router over explicit multiplexers
    pub fn with_multiplexers(
        config: &Config,
        device: Arc<dyn VirtualInterface>,
        direct: Arc<dyn Multiplexer>,
        upstream: Arc<dyn Multiplexer>,
    ) -> Result<Self> {
        let endpoints = config.endpoints.iter().map(|e| e.id.clone()).collect();
        let routes = RouteTable::new(&config.routing, endpoints)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            device,
            routes: Arc::new(routes),
            sessions: Arc::new(SessionTable::new(SessionLimits::from(&config.session))),
            stats: Arc::new(StatsCollector::new()),
            dns: Arc::new(DnsCache::default()),
            direct,
            upstream,
            failures: DashMap::new(),
            max_failures: config.transport.max_consecutive_failures.max(1),
            mtu: config.interface.mtu,
            sweep_interval: config.session.sweep_interval(),
            drain_timeout: config.shutdown_timeout(),
            shutdown_tx,
            stopping: AtomicBool::new(false),
            fatal: Mutex::new(None),
        })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    /// Run until `shutdown` is called or the device fails.
    ///
    /// Returns the device error that ended the tunnel, if any. All tasks are
    /// stopped and the device and multiplexers closed before this returns.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "[Tunnel] Starting on {} (mtu {}, {} rules)",
            self.device.name(),
            self.mtu,
            self.routes.load().len()
        );

        // Subscribe before anything can signal shutdown
        let device_shutdown = self.shutdown_tx.subscribe();
        let mut tasks = Vec::new();
        for mux in [self.direct.clone(), self.upstream.clone()] {
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(self.clone().network_loop(mux, shutdown)));
        }
        let sweep_shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(self.clone().sweep_loop(sweep_shutdown)));

        self.device_loop(device_shutdown).await;
        self.teardown(tasks).await;

        match self.fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ask all loops to stop
    pub fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            debug!("[Tunnel] Shutdown requested");
        }
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Record the first fatal error and stop
    fn fail(&self, err: Error) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!("[Tunnel] Fatal: {}", err);
                *fatal = Some(err);
            }
        }
        self.shutdown();
    }

    // ========================================================================
    // Device → network
    // ========================================================================

    async fn device_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            if self.is_stopping() {
                return;
            }
            let read = tokio::select! {
                _ = shutdown.recv() => return,
                read = self.device.read(&mut buf) => read,
            };
            match read {
                Ok(n) => self.forward_outbound(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    if !self.is_stopping() {
                        self.fail(Error::VirtualInterface(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    /// Route and forward one packet read from the device
    pub fn forward_outbound(&self, data: Bytes) {
        if data.len() > self.mtu {
            trace!("[Tunnel] Dropping {} byte packet above mtu", data.len());
            self.stats.record_dropped(DropReason::Oversize);
            return;
        }
        let packet = match packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("[Tunnel] {}", e);
                self.stats.record_malformed();
                return;
            }
        };

        let flow = packet.flow_key();
        let dest = Destination::new(flow.protocol, flow.dst)
            .with_domain(self.dns.lookup(&flow.dst.ip()));
        let (action, rule) = self.routes.resolve_tagged(&dest);
        ROUTER_DECISIONS_TOTAL.inc();
        ROUTER_RULE_HITS.with_label_values(&[rule.as_ref()]).inc();

        if action.is_block() {
            trace!("[Tunnel] {} blocked by {}", flow, rule);
            self.stats.record_blocked();
            return;
        }

        // Pinned before use so the sweeper can't evict it mid-forward
        let guard = match self.sessions.pin_flow(&flow) {
            Some(guard) => guard,
            None if !opens_session(&packet) => {
                self.stats.record_dropped(DropReason::NoSession);
                return;
            }
            None => match self.sessions.get_or_create_pinned(flow, action) {
                Ok((guard, created)) => {
                    if created {
                        let session = guard.session();
                        debug!("[Tunnel] {} -> {} via {}", flow, session.action, rule);
                        self.stats.session_opened(session);
                    }
                    guard
                }
                Err(e) => {
                    warn!("[Tunnel] {}: {}", flow, e);
                    let reason = match e {
                        Error::SessionLimit(_) => DropReason::SessionLimit,
                        _ => DropReason::NoSession,
                    };
                    self.stats.record_dropped(reason);
                    return;
                }
            },
        };
        let session = Arc::clone(guard.session());
        session.touch();
        let rst = match packet.tcp() {
            Some(tcp) => {
                session.on_tcp_flags(Direction::Upload, tcp.flags);
                tcp.flags.is_rst()
            }
            None => false,
        };

        let (mux, endpoint) = match &session.action {
            Action::Direct => (&self.direct, None),
            Action::Proxy(endpoint) => (&self.upstream, Some(&**endpoint)),
            Action::Block => {
                self.stats.record_blocked();
                return;
            }
        };

        match mux.send(session.id, endpoint, &packet) {
            Ok(()) => {
                self.failures.remove(&session.id);
                self.stats.record(&session, Direction::Upload, packet.len());
                if rst {
                    drop(guard);
                    self.end_session(session.id, "reset by client");
                }
            }
            Err(e) => {
                self.stats.record_dropped(DropReason::SendFailed);
                TRANSPORT_SEND_FAILURES
                    .with_label_values(&[mux.name()])
                    .inc();
                let failures = {
                    let mut count = self.failures.entry(session.id).or_insert(0);
                    *count += 1;
                    *count
                };
                debug!(
                    "[Tunnel] Session #{} send via {} failed ({}/{}): {}",
                    session.id,
                    mux.name(),
                    failures,
                    self.max_failures,
                    e
                );
                if failures >= self.max_failures {
                    drop(guard);
                    self.end_session(session.id, "too many send failures");
                }
            }
        }
    }

    // ========================================================================
    // Network → device
    // ========================================================================

    async fn network_loop(
        self: Arc<Self>,
        mux: Arc<dyn Multiplexer>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!("[Tunnel] {} return path started", mux.name());
        loop {
            let batch = tokio::select! {
                _ = shutdown.recv() => break,
                batch = mux.poll() => batch,
            };
            if batch.is_empty() {
                // Multiplexer closed
                break;
            }
            for delivery in batch {
                self.deliver(delivery).await;
            }
        }
        debug!("[Tunnel] {} return path stopped", mux.name());
    }

    async fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Packet { session, packet } => self.forward_inbound(session, packet).await,
            Delivery::Failed { session, reason } => {
                TRANSPORT_SESSIONS_FAILED.inc();
                self.end_session(session, &reason);
            }
        }
    }

    async fn forward_inbound(&self, id: SessionId, data: Bytes) {
        let Some(guard) = self.sessions.pin(id) else {
            trace!("[Tunnel] Return packet for unknown session #{}", id);
            self.stats.record_dropped(DropReason::UnknownSession);
            return;
        };
        let session = Arc::clone(guard.session());

        let reply = match packet::parse(data)
            .and_then(|packet| packet.readdress(session.flow.dst, session.flow.src))
        {
            Ok(reply) => reply,
            Err(e) => {
                trace!("[Tunnel] Session #{} return packet: {}", id, e);
                self.stats.record_malformed();
                return;
            }
        };
        if reply.len() > self.mtu {
            self.stats.record_dropped(DropReason::Oversize);
            return;
        }

        session.touch();
        let rst = match reply.tcp() {
            Some(tcp) => {
                session.on_tcp_flags(Direction::Download, tcp.flags);
                tcp.flags.is_rst()
            }
            None => false,
        };
        self.learn_dns(&reply);

        let bytes = packet::serialize(&reply);
        if let Err(e) = self.device.write(&bytes).await {
            self.stats.record_dropped(DropReason::DeviceWrite);
            if !self.is_stopping() {
                self.fail(Error::VirtualInterface(e.to_string()));
            }
            return;
        }
        self.stats.record(&session, Direction::Download, bytes.len());

        if rst {
            drop(guard);
            self.end_session(id, "reset by remote");
        }
    }

    fn learn_dns(&self, reply: &ParsedPacket) {
        if reply.protocol() == IpProtocol::Udp && reply.source().port() == DNS_PORT {
            let learned = self.dns.learn_response(&reply.payload());
            if learned > 0 {
                trace!("[Tunnel] Learned {} DNS mappings", learned);
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn mux_for(&self, action: &Action) -> Option<&Arc<dyn Multiplexer>> {
        match action {
            Action::Direct => Some(&self.direct),
            Action::Proxy(_) => Some(&self.upstream),
            Action::Block => None,
        }
    }

    fn release(&self, session: &Session) {
        self.failures.remove(&session.id);
        self.stats.session_closed(session);
        if let Some(mux) = self.mux_for(&session.action) {
            mux.release(session.id);
        }
    }

    /// Close a session and free its transport resources
    pub fn end_session(&self, id: SessionId, reason: &str) {
        if let Some(session) = self.sessions.close(id, reason) {
            self.release(&session);
        } else {
            self.failures.remove(&id);
        }
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }

    /// Evict idle sessions as of `now`
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted = self.sessions.sweep_idle(now);
        for session in &evicted {
            self.release(session);
        }
        evicted.len()
    }

    async fn teardown(&self, mut tasks: Vec<JoinHandle<()>>) {
        self.shutdown();
        self.device.close().await;
        self.direct.close().await;
        self.upstream.close().await;

        let drain = async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                "[Tunnel] Tasks still running after {:?}, aborting",
                self.drain_timeout
            );
            for task in &tasks {
                task.abort();
            }
        }

        let remaining = self.sessions.drain();
        for session in &remaining {
            self.stats.session_closed(session);
        }
        self.failures.clear();

        let snapshot = self.stats.snapshot();
        info!(
            "[Tunnel] Stopped: up {} B, down {} B, {} sessions closed",
            snapshot.total_upload,
            snapshot.total_download,
            remaining.len()
        );
    }
}
