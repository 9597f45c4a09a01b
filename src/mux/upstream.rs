//! Upstream multiplexer
//!
//! One link per configured endpoint. Each link is a background task that
//! dials the endpoint, authenticates, and then pumps frames in both
//! directions. Sessions routed to the same endpoint share its link.
//!
//! ```text
//!                 ┌──────────── UpstreamLink "hk" ─────────────┐
//!   send ──▶ queue│──▶ DATA frames ──▶ TLS/TCP ──▶ endpoint     │
//!                 │                                   │         │
//!   poll ◀── deliveries ◀── DATA/CLOSE frames ◀───────┘         │
//!                 └────────────────────────────────────────────┘
//! ```
//!
//! A link that loses its connection redials with exponential backoff. When
//! the attempts run out, every session bound to it is reported failed and
//! the link cools down before a later send may dial again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::common::{Address, Stream};
use crate::config::{Credentials, EndpointConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::packet::ParsedPacket;
use crate::session::SessionId;
use crate::transport::{self, Backoff, Transport};

use super::frame::{Frame, FrameKind};
use super::{Delivery, DeliveryQueue, Multiplexer};

const READ_BUFFER: usize = 64 * 1024;
/// Frames coalesced into one write
const WRITE_BATCH: usize = 32 * 1024;
const LINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Uptime after which a link counts as healthy even if the endpoint stayed silent
const STABLE_LINK: Duration = Duration::from_secs(10);

// ============================================================================
// Link
// ============================================================================

enum LinkState {
    Idle,
    Running {
        tx: mpsc::Sender<Frame>,
        task: JoinHandle<()>,
    },
    Cooldown {
        until: Instant,
    },
}

/// Connection to one upstream endpoint
struct UpstreamLink {
    id: String,
    address: Address,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    config: TransportConfig,
    state: Mutex<LinkState>,
    sessions: DashSet<SessionId>,
}

enum PumpExit {
    Shutdown,
    /// `proven` is set once the endpoint sent at least one valid frame
    Disconnected { reason: String, proven: bool },
}

impl UpstreamLink {
    fn new(endpoint: &EndpointConfig, transport: Arc<dyn Transport>, config: &TransportConfig) -> Self {
        Self {
            id: endpoint.id.clone(),
            address: Address::from_host(&endpoint.address, endpoint.port),
            transport,
            credentials: endpoint.credentials.clone(),
            config: config.clone(),
            state: Mutex::new(LinkState::Idle),
            sessions: DashSet::new(),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_max_ms)
    }

    /// Dial and authenticate
    async fn establish(&self) -> Result<Stream> {
        let mut stream = tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.connect(&self.address),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        let mut buf = BytesMut::new();
        Frame::auth(&self.credentials)?.encode(&mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(stream)
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Frame>,
        deliveries: mpsc::Sender<Delivery>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            let result = tokio::select! {
                result = self.establish() => result,
                _ = shutdown.recv() => return,
            };

            match result {
                Ok(stream) => {
                    let connected_at = Instant::now();
                    info!(
                        "[Upstream] Link {} connected to {} via {}",
                        self.id,
                        self.address,
                        self.transport.name()
                    );
                    match self.pump(stream, &mut rx, &deliveries, &mut shutdown).await {
                        PumpExit::Shutdown => return,
                        PumpExit::Disconnected { reason, proven } => {
                            warn!("[Upstream] Link {} disconnected: {}", self.id, reason);
                            // A link dropped right after the handshake is a failed attempt
                            if proven || connected_at.elapsed() >= STABLE_LINK {
                                backoff.reset();
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[Upstream] Link {} connect failed: {}", self.id, e);
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        "[Upstream] Link {} reconnecting in {:?} (attempt {})",
                        self.id,
                        delay,
                        backoff.attempts()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => return,
                    }
                }
                None => {
                    self.give_up(&deliveries, backoff.attempts()).await;
                    return;
                }
            }
        }
    }

    async fn pump(
        &self,
        stream: Stream,
        rx: &mut mpsc::Receiver<Frame>,
        deliveries: &mpsc::Sender<Delivery>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> PumpExit {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER);
        let mut write_buf = BytesMut::with_capacity(WRITE_BATCH);
        let mut proven = false;
        let disconnected = |reason: String, proven: bool| PumpExit::Disconnected { reason, proven };

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => return PumpExit::Shutdown,
                    };
                    write_buf.clear();
                    if let Err(e) = frame.encode(&mut write_buf) {
                        warn!("[Upstream] Link {} dropped frame: {}", self.id, e);
                        continue;
                    }
                    while write_buf.len() < WRITE_BATCH {
                        match rx.try_recv() {
                            Ok(more) => {
                                if let Err(e) = more.encode(&mut write_buf) {
                                    warn!("[Upstream] Link {} dropped frame: {}", self.id, e);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = writer.write_all(&write_buf).await {
                        return disconnected(e.to_string(), proven);
                    }
                    if let Err(e) = writer.flush().await {
                        return disconnected(e.to_string(), proven);
                    }
                }
                read = reader.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => return disconnected("closed by endpoint".into(), proven),
                        Ok(_) => {}
                        Err(e) => return disconnected(e.to_string(), proven),
                    }
                    loop {
                        match Frame::decode(&mut read_buf) {
                            Ok(Some(frame)) => {
                                proven = true;
                                if !self.on_frame(frame, deliveries).await {
                                    return PumpExit::Shutdown;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return disconnected(e.to_string(), proven),
                        }
                    }
                }
                _ = shutdown.recv() => return PumpExit::Shutdown,
            }
        }
    }

    /// Handle one frame from the endpoint. Returns false once the router is
    /// no longer listening.
    async fn on_frame(&self, frame: Frame, deliveries: &mpsc::Sender<Delivery>) -> bool {
        let delivery = match frame.kind {
            FrameKind::Data => {
                if !self.sessions.contains(&frame.session) {
                    trace!(
                        "[Upstream] Link {} dropped data for unknown session #{}",
                        self.id,
                        frame.session
                    );
                    return true;
                }
                Delivery::Packet {
                    session: frame.session,
                    packet: frame.payload,
                }
            }
            FrameKind::Close => {
                if self.sessions.remove(&frame.session).is_none() {
                    return true;
                }
                Delivery::Failed {
                    session: frame.session,
                    reason: format!("closed by endpoint {}", self.id),
                }
            }
            FrameKind::Auth => return true,
        };
        deliveries.send(delivery).await.is_ok()
    }

    /// Attempts exhausted: fail every bound session and cool down
    async fn give_up(&self, deliveries: &mpsc::Sender<Delivery>, attempts: u32) {
        *self.state.lock() = LinkState::Cooldown {
            until: Instant::now() + self.cooldown(),
        };
        let sessions: Vec<SessionId> = self.sessions.iter().map(|s| *s).collect();
        self.sessions.clear();
        warn!(
            "[Upstream] Link {} unreachable after {} attempts, failing {} sessions",
            self.id,
            attempts,
            sessions.len()
        );
        for session in sessions {
            let delivery = Delivery::Failed {
                session,
                reason: format!("endpoint {} unreachable", self.id),
            };
            if deliveries.send(delivery).await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// Multiplexes sessions over one upstream link per endpoint
pub struct UpstreamMux {
    links: HashMap<String, Arc<UpstreamLink>>,
    bindings: DashMap<SessionId, Arc<UpstreamLink>>,
    deliveries: DeliveryQueue,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl UpstreamMux {
    /// Build links for the configured endpoints. Nothing is dialed until the
    /// first packet for an endpoint arrives.
    pub fn new(endpoints: &[EndpointConfig], config: &TransportConfig) -> Self {
        let links = endpoints
            .iter()
            .map(|endpoint| {
                let transport = transport::for_endpoint(endpoint, config.connect_timeout());
                (endpoint.clone(), transport)
            })
            .collect();
        Self::with_transports(links, config)
    }

    /// Build links with explicit transports
    pub fn with_transports(
        endpoints: Vec<(EndpointConfig, Arc<dyn Transport>)>,
        config: &TransportConfig,
    ) -> Self {
        let links = endpoints
            .into_iter()
            .map(|(endpoint, transport)| {
                let link = Arc::new(UpstreamLink::new(&endpoint, transport, config));
                (endpoint.id, link)
            })
            .collect();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            links,
            bindings: DashMap::new(),
            deliveries: DeliveryQueue::new(config.queue_depth),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Sender for a running link, starting it if needed
    fn running_sender(&self, link: &Arc<UpstreamLink>) -> Result<mpsc::Sender<Frame>> {
        let mut state = link.state.lock();
        match &*state {
            LinkState::Running { tx, .. } if !tx.is_closed() => return Ok(tx.clone()),
            LinkState::Cooldown { until } if Instant::now() < *until => {
                return Err(Error::Transport(format!("link {} is cooling down", link.id)));
            }
            _ => {}
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        debug!("[Upstream] Starting link {} to {}", link.id, link.address);
        let (tx, rx) = mpsc::channel(link.config.queue_depth.max(1));
        let task = tokio::spawn(Arc::clone(link).run(
            rx,
            self.deliveries.sender(),
            self.shutdown.subscribe(),
        ));
        *state = LinkState::Running {
            tx: tx.clone(),
            task,
        };
        Ok(tx)
    }

    /// Number of sessions bound to an endpoint's link
    pub fn bound_sessions(&self, endpoint: &str) -> usize {
        self.links
            .get(endpoint)
            .map(|link| link.sessions.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Multiplexer for UpstreamMux {
    fn send(
        &self,
        session: SessionId,
        endpoint: Option<&str>,
        packet: &ParsedPacket,
    ) -> Result<()> {
        let endpoint = endpoint
            .ok_or_else(|| Error::Transport("upstream send without endpoint".into()))?;
        let link = self
            .links
            .get(endpoint)
            .ok_or_else(|| Error::Transport(format!("unknown endpoint: {}", endpoint)))?;

        let tx = self.running_sender(link)?;
        if link.sessions.insert(session) {
            self.bindings.insert(session, Arc::clone(link));
        }

        tx.try_send(Frame::data(session, packet.as_bytes().clone()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    Error::Transport(format!("link {} queue full", link.id))
                }
                TrySendError::Closed(_) => Error::Transport(format!("link {} is down", link.id)),
            })
    }

    async fn poll(&self) -> Vec<Delivery> {
        self.deliveries.next_batch().await
    }

    fn release(&self, session: SessionId) {
        let Some((_, link)) = self.bindings.remove(&session) else {
            return;
        };
        link.sessions.remove(&session);
        let state = link.state.lock();
        if let LinkState::Running { tx, .. } = &*state {
            // Best effort; the endpoint also times sessions out on its own
            let _ = tx.try_send(Frame::close(session));
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());

        let mut tasks = Vec::new();
        for link in self.links.values() {
            let state = std::mem::replace(&mut *link.state.lock(), LinkState::Idle);
            if let LinkState::Running { task, .. } = state {
                tasks.push(task);
            }
            link.sessions.clear();
        }
        // One drain budget shared by all links
        let deadline = Instant::now() + LINK_DRAIN_TIMEOUT;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.bindings.clear();
        self.deliveries.close();
        info!("[Upstream] Closed {} links", self.links.len());
    }

    fn name(&self) -> &'static str {
        "upstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse, PacketBuilder};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn endpoint(id: &str, addr: std::net::SocketAddr) -> EndpointConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "address": addr.ip().to_string(),
            "port": addr.port(),
            "credentials": { "method": "aes-256-gcm", "password": "pw" }
        }))
        .unwrap()
    }

    fn packet() -> ParsedPacket {
        parse(
            PacketBuilder::udp(
                "10.0.0.2:40000".parse().unwrap(),
                "1.1.1.1:53".parse().unwrap(),
                b"query",
            )
            .unwrap(),
        )
        .unwrap()
    }

    async fn read_frame(socket: &mut tokio::net::TcpStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = Frame::decode(buf).unwrap() {
                return frame;
            }
            let n = socket.read_buf(buf).await.unwrap();
            assert!(n > 0, "link closed early");
        }
    }

    #[tokio::test]
    async fn test_auth_then_data_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let auth = read_frame(&mut socket, &mut buf).await;
            assert_eq!(auth.kind, FrameKind::Auth);
            assert_eq!(&auth.payload[..], b"\x0baes-256-gcm\x02pw");

            let data = read_frame(&mut socket, &mut buf).await;
            assert_eq!(data.kind, FrameKind::Data);

            // Echo it back as the reply
            let mut out = BytesMut::new();
            Frame::data(data.session, data.payload.clone())
                .encode(&mut out)
                .unwrap();
            socket.write_all(&out).await.unwrap();
            data
        });

        let mux = UpstreamMux::new(&[endpoint("hk", addr)], &TransportConfig::default());
        let pkt = packet();
        mux.send(7, Some("hk"), &pkt).unwrap();
        assert_eq!(mux.bound_sessions("hk"), 1);

        let batch = mux.poll().await;
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Delivery::Packet { session, packet } => {
                assert_eq!(*session, 7);
                assert_eq!(packet, pkt.as_bytes());
            }
            other => panic!("unexpected delivery: {:?}", other),
        }

        let sent = server.await.unwrap();
        assert_eq!(sent.session, 7);
        mux.close().await;
        assert!(mux.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_send_error() {
        let mux = UpstreamMux::new(&[], &TransportConfig::default());
        assert!(matches!(
            mux.send(1, Some("nowhere"), &packet()),
            Err(Error::Transport(_))
        ));
        assert!(mux.send(1, None, &packet()).is_err());
    }

    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn connect(&self, _addr: &Address) -> Result<Stream> {
            Err(Error::Transport("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_link_fails_sessions_and_cools_down() {
        let config = TransportConfig::default();
        let ep = endpoint("hk", "192.0.2.1:443".parse().unwrap());
        let mux = UpstreamMux::with_transports(vec![(ep, Arc::new(Refusing))], &config);

        mux.send(1, Some("hk"), &packet()).unwrap();
        mux.send(2, Some("hk"), &packet()).unwrap();

        let mut failed = Vec::new();
        while failed.len() < 2 {
            for delivery in mux.poll().await {
                match delivery {
                    Delivery::Failed { session, .. } => failed.push(session),
                    other => panic!("unexpected delivery: {:?}", other),
                }
            }
        }
        failed.sort();
        assert_eq!(failed, vec![1, 2]);
        assert_eq!(mux.bound_sessions("hk"), 0);

        // Cooling down: sends fail fast
        assert!(mux.send(3, Some("hk"), &packet()).is_err());

        // After the cooldown a send may dial again
        tokio::time::advance(Duration::from_millis(config.reconnect_max_ms + 1)).await;
        assert!(mux.send(3, Some("hk"), &packet()).is_ok());
        mux.close().await;
    }

    #[tokio::test]
    async fn test_link_dropped_after_connect_counts_as_attempt() {
        use std::sync::atomic::AtomicUsize;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));

        // Accept the handshake, then hang up straight away
        let counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let config = TransportConfig {
            max_reconnect_attempts: 3,
            reconnect_base_ms: 10,
            reconnect_max_ms: 40,
            ..Default::default()
        };
        let mux = UpstreamMux::new(&[endpoint("hk", addr)], &config);
        mux.send(1, Some("hk"), &packet()).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), mux.poll())
            .await
            .expect("link never gave up");
        assert!(matches!(batch[0], Delivery::Failed { session: 1, .. }));
        // First dial plus the configured retries
        assert!(accepts.load(Ordering::SeqCst) <= 4);
        assert_eq!(mux.bound_sessions("hk"), 0);
        mux.close().await;
    }

    /// Hands out one end of an in-memory pipe
    struct Piped(Mutex<Option<tokio::io::DuplexStream>>);

    #[async_trait]
    impl Transport for Piped {
        async fn connect(&self, _addr: &Address) -> Result<Stream> {
            match self.0.lock().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(Error::Transport("pipe already used".into())),
            }
        }

        fn name(&self) -> &'static str {
            "piped"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_shares_one_drain_budget_across_links() {
        let config = TransportConfig {
            queue_depth: 1,
            ..Default::default()
        };
        let mut remotes = Vec::new();
        let mut endpoints = Vec::new();
        for (i, id) in ["a", "b"].into_iter().enumerate() {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            let addr = format!("192.0.2.{}:443", i + 1).parse().unwrap();
            let transport: Arc<dyn Transport> = Arc::new(Piped(Mutex::new(Some(local))));
            endpoints.push((endpoint(id, addr), transport));
            remotes.push(remote);
        }
        let mux = UpstreamMux::with_transports(endpoints, &config);
        mux.send(1, Some("a"), &packet()).unwrap();
        mux.send(2, Some("b"), &packet()).unwrap();

        // Nobody polls, so both links end up stuck handing over deliveries
        for (session, remote) in [1u64, 2].into_iter().zip(remotes.iter_mut()) {
            let mut out = BytesMut::new();
            for _ in 0..3 {
                Frame::data(session, Bytes::from_static(b"reply"))
                    .encode(&mut out)
                    .unwrap();
            }
            remote.write_all(&out).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        mux.close().await;
        assert!(started.elapsed() < LINK_DRAIN_TIMEOUT + Duration::from_millis(100));
        assert!(mux.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_data_for_released_session_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let _auth = read_frame(&mut socket, &mut buf).await;
            let _data = read_frame(&mut socket, &mut buf).await;
            release_rx.await.unwrap();
            let close = read_frame(&mut socket, &mut buf).await;
            assert_eq!(close.kind, FrameKind::Close);

            let mut out = BytesMut::new();
            Frame::data(1, Bytes::from_static(b"late")).encode(&mut out).unwrap();
            Frame::data(2, Bytes::from_static(b"live")).encode(&mut out).unwrap();
            socket.write_all(&out).await.unwrap();
            // Keep the link up until the test finishes
            let _ = socket.read_buf(&mut buf).await;
        });

        let mux = UpstreamMux::new(&[endpoint("hk", addr)], &TransportConfig::default());
        mux.send(1, Some("hk"), &packet()).unwrap();
        mux.release(1);
        mux.send(2, Some("hk"), &packet()).unwrap();
        release_tx.send(()).unwrap();

        let batch = mux.poll().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].session(), 2);
        mux.close().await;
    }
}
