//! Direct multiplexer
//!
//! Flows routed DIRECT leave through the host's own network stack: UDP over
//! a per-flow connected socket, TCP through a per-flow terminator. Replies
//! are wrapped back into IP packets addressed to the client.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::common::{FlowKey, IpProtocol};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::packet::{PacketBuilder, ParsedPacket};
use crate::session::SessionId;

use super::tcp_relay::TcpRelay;
use super::{Delivery, DeliveryQueue, Multiplexer};

/// Per-flow inbound queue depth
const FLOW_QUEUE: usize = 256;
const UDP_BUFFER: usize = 65535;

/// Settings for the direct path
#[derive(Debug, Clone)]
pub struct DirectSettings {
    /// Interface MTU; bounds the segments generated toward the client
    pub mtu: usize,
    pub connect_timeout: Duration,
    pub queue_depth: usize,
}

impl DirectSettings {
    pub fn new(mtu: usize, transport: &TransportConfig) -> Self {
        Self {
            mtu,
            connect_timeout: transport.connect_timeout(),
            queue_depth: transport.queue_depth,
        }
    }

    /// TCP MSS for a flow: MTU minus IP and TCP headers
    pub fn mss_for(&self, flow: &FlowKey) -> usize {
        let ip_header = if flow.dst.is_ipv4() { 20 } else { 40 };
        self.mtu.saturating_sub(ip_header + 20)
    }
}

struct DirectFlow {
    tx: mpsc::Sender<ParsedPacket>,
    task: JoinHandle<()>,
}

/// Per-flow sockets for traffic that bypasses the tunnel
pub struct DirectMux {
    flows: DashMap<SessionId, DirectFlow>,
    deliveries: DeliveryQueue,
    settings: DirectSettings,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl DirectMux {
    pub fn new(settings: DirectSettings) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            flows: DashMap::new(),
            deliveries: DeliveryQueue::new(settings.queue_depth),
            settings,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_flow(&self, session: SessionId, flow: FlowKey) -> DirectFlow {
        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        let deliveries = self.deliveries.sender();
        let shutdown = self.shutdown.subscribe();
        let task = if flow.is_tcp() {
            let relay = TcpRelay::new(
                session,
                flow,
                self.settings.mss_for(&flow),
                self.settings.connect_timeout,
                deliveries,
            );
            tokio::spawn(relay.run(rx, shutdown))
        } else {
            tokio::spawn(run_udp(session, flow, rx, deliveries, shutdown))
        };
        DirectFlow { tx, task }
    }

    /// Number of flows with live resources
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }
}

async fn run_udp(
    session: SessionId,
    flow: FlowKey,
    mut rx: mpsc::Receiver<ParsedPacket>,
    deliveries: mpsc::Sender<Delivery>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let bind: SocketAddr = if flow.dst.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = deliveries
                .send(Delivery::Failed {
                    session,
                    reason: format!("udp bind failed: {}", e),
                })
                .await;
            return;
        }
    };
    if let Err(e) = socket.connect(flow.dst).await {
        let _ = deliveries
            .send(Delivery::Failed {
                session,
                reason: format!("udp connect {} failed: {}", flow.dst, e),
            })
            .await;
        return;
    }

    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else { return };
                if let Err(e) = socket.send(&packet.payload()).await {
                    debug!("[Direct] #{} udp send to {} failed: {}", session, flow.dst, e);
                }
            }
            received = socket.recv(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(e) => {
                        // ICMP errors surface here on connected sockets
                        trace!("[Direct] #{} udp recv: {}", session, e);
                        continue;
                    }
                };
                match PacketBuilder::udp(flow.dst, flow.src, &buf[..n]) {
                    Ok(packet) => {
                        if deliveries.send(Delivery::Packet { session, packet }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("[Direct] #{} dropped reply: {}", session, e),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[async_trait]
impl Multiplexer for DirectMux {
    fn send(
        &self,
        session: SessionId,
        _endpoint: Option<&str>,
        packet: &ParsedPacket,
    ) -> Result<()> {
        match packet.protocol() {
            IpProtocol::Tcp | IpProtocol::Udp => {}
            other => {
                return Err(Error::Transport(format!(
                    "{} is not supported on the direct path",
                    other
                )))
            }
        }
        if packet.is_fragment() {
            return Err(Error::Transport(
                "fragmented datagrams are not supported on the direct path".into(),
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let tx = match self.flows.entry(session) {
            Entry::Occupied(entry) => entry.get().tx.clone(),
            Entry::Vacant(entry) => {
                let flow = self.spawn_flow(session, packet.flow_key());
                let tx = flow.tx.clone();
                entry.insert(flow);
                tx
            }
        };

        match tx.try_send(packet.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::Transport(format!("direct flow #{} queue full", session)))
            }
            Err(TrySendError::Closed(_)) => {
                self.flows.remove(&session);
                Err(Error::Transport(format!("direct flow #{} has ended", session)))
            }
        }
    }

    async fn poll(&self) -> Vec<Delivery> {
        self.deliveries.next_batch().await
    }

    fn release(&self, session: SessionId) {
        if let Some((_, flow)) = self.flows.remove(&session) {
            flow.task.abort();
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        let ids: Vec<SessionId> = self.flows.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            self.release(id);
        }
        self.deliveries.close();
        info!("[Direct] Closed {} flows", count);
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
