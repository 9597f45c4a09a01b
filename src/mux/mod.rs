//! Transport Multiplexer
//!
//! Responsibilities:
//! - Carry session traffic to the network (per-flow direct sockets, or
//!   shared upstream links per endpoint)
//! - Hand return traffic back to the router as deliveries
//! - Report sessions whose path failed for good
//!
//! ```text
//!               send(session, endpoint, packet)
//!   Router ─────────────────────────────────────▶ Multiplexer ──▶ network
//!     ▲                                               │
//!     └──────────── poll() -> Vec<Delivery> ◀─────────┘
//! ```
//!
//! `send` never blocks: every path has a bounded queue and a full queue is a
//! send error, not backpressure on the device loop.

pub mod direct;
pub mod frame;
mod tcp_relay;
pub mod upstream;

pub use direct::DirectMux;
pub use frame::{Frame, FrameKind};
pub use upstream::UpstreamMux;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::Result;
use crate::packet::ParsedPacket;
use crate::session::SessionId;

/// Most deliveries returned by a single `poll`
const MAX_BATCH: usize = 64;

/// Something the network handed back for a session
#[derive(Debug)]
pub enum Delivery {
    /// A raw IP packet addressed to the session's client
    Packet { session: SessionId, packet: Bytes },
    /// The session's path is gone and will not recover
    Failed { session: SessionId, reason: String },
}

impl Delivery {
    pub fn session(&self) -> SessionId {
        match self {
            Delivery::Packet { session, .. } | Delivery::Failed { session, .. } => *session,
        }
    }
}

/// A way of moving session traffic to and from the network
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Queue a packet for the network. Never blocks.
    fn send(&self, session: SessionId, endpoint: Option<&str>, packet: &ParsedPacket)
        -> Result<()>;

    /// Wait for at least one delivery and return everything that is ready.
    ///
    /// Returns an empty batch once the multiplexer is closed.
    async fn poll(&self) -> Vec<Delivery>;

    /// Drop any per-session resources
    fn release(&self, session: SessionId);

    /// Stop all background work
    async fn close(&self);

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Delivery channel shared by a multiplexer's background tasks
pub(crate) struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    closed: watch::Sender<bool>,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Delivery> {
        self.tx.clone()
    }

    /// Wait for one delivery, then drain what is ready, up to a batch.
    /// Returns an empty batch once the queue is closed.
    pub(crate) async fn next_batch(&self) -> Vec<Delivery> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Vec::new();
        }
        let mut rx = self.rx.lock().await;
        let first = tokio::select! {
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => return Vec::new(),
            },
            _ = closed.changed() => return Vec::new(),
        };
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(delivery) => batch.push(delivery),
                Err(_) => break,
            }
        }
        batch
    }

    /// Wake any pending `next_batch` and make later calls return empty
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }
}
