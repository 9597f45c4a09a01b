//! Stats Collector
//!
//! Tunnel-wide traffic counters. Writers only touch atomics; a snapshot
//! reads them without blocking anyone. Every update is mirrored to the
//! Prometheus registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::common::{Direction, FlowKey};
use crate::session::{Session, SessionCounters, SessionId};

use super::metrics::{
    init_metrics, PACKETS_DROPPED, SESSIONS_ACTIVE, SESSIONS_TOTAL, SESSION_DURATION_SECONDS,
    TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED, TRAFFIC_PACKETS,
};

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Larger than the interface MTU
    Oversize,
    /// Return traffic for a session that no longer exists
    UnknownSession,
    /// The multiplexer refused it
    SendFailed,
    /// Session table full
    SessionLimit,
    /// Lone RST or other packet that may not open a session
    NoSession,
    /// Writing to the device failed
    DeviceWrite,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Oversize => "oversize",
            DropReason::UnknownSession => "unknown_session",
            DropReason::SendFailed => "send_failed",
            DropReason::SessionLimit => "session_limit",
            DropReason::NoSession => "no_session",
            DropReason::DeviceWrite => "device_write",
        }
    }
}

/// Per-session view in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub id: SessionId,
    pub flow: FlowKey,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub upload_packets: u64,
    pub download_packets: u64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub total_upload: u64,
    pub total_download: u64,
    pub packets_up: u64,
    pub packets_down: u64,
    pub malformed: u64,
    pub blocked: u64,
    pub dropped: u64,
    pub active_sessions: usize,
    pub per_session: Vec<SessionStats>,
}

/// Global statistics collector
#[derive(Default)]
pub struct StatsCollector {
    upload: AtomicU64,
    download: AtomicU64,
    packets_up: AtomicU64,
    packets_down: AtomicU64,
    malformed: AtomicU64,
    blocked: AtomicU64,
    dropped: AtomicU64,
    sessions: DashMap<SessionId, (FlowKey, Arc<SessionCounters>)>,
}

impl StatsCollector {
    pub fn new() -> Self {
        init_metrics();
        Self::default()
    }

    /// Count a forwarded packet of `bytes` for `session`
    pub fn record(&self, session: &Session, direction: Direction, bytes: usize) {
        let bytes = bytes as u64;
        session.counters.add(direction, bytes);
        match direction {
            Direction::Upload => {
                self.upload.fetch_add(bytes, Ordering::Relaxed);
                self.packets_up.fetch_add(1, Ordering::Relaxed);
                TRAFFIC_BYTES_UPLOADED.inc_by(bytes);
                TRAFFIC_PACKETS.with_label_values(&["upload"]).inc();
            }
            Direction::Download => {
                self.download.fetch_add(bytes, Ordering::Relaxed);
                self.packets_down.fetch_add(1, Ordering::Relaxed);
                TRAFFIC_BYTES_DOWNLOADED.inc_by(bytes);
                TRAFFIC_PACKETS.with_label_values(&["download"]).inc();
            }
        }
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        PACKETS_DROPPED.with_label_values(&["malformed"]).inc();
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        PACKETS_DROPPED.with_label_values(&["blocked"]).inc();
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        PACKETS_DROPPED.with_label_values(&[reason.as_str()]).inc();
    }

    /// Start tracking a new session
    pub fn session_opened(&self, session: &Session) {
        self.sessions
            .insert(session.id, (session.flow, session.counters.clone()));
        SESSIONS_TOTAL
            .with_label_values(&[action_label(session)])
            .inc();
        SESSIONS_ACTIVE.inc();
    }

    /// Stop tracking a session. Totals keep what it contributed.
    pub fn session_closed(&self, session: &Session) {
        if self.sessions.remove(&session.id).is_some() {
            SESSIONS_ACTIVE.dec();
            SESSION_DURATION_SECONDS
                .with_label_values(&[action_label(session)])
                .observe(session.created_at.elapsed().as_secs_f64());
        }
    }

    pub fn total_upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn total_download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let per_session = self
            .sessions
            .iter()
            .map(|entry| {
                let (flow, counters) = entry.value();
                SessionStats {
                    id: *entry.key(),
                    flow: *flow,
                    upload_bytes: counters.bytes_up.load(Ordering::Relaxed),
                    download_bytes: counters.bytes_down.load(Ordering::Relaxed),
                    upload_packets: counters.packets_up.load(Ordering::Relaxed),
                    download_packets: counters.packets_down.load(Ordering::Relaxed),
                }
            })
            .collect::<Vec<_>>();

        StatsSnapshot {
            total_upload: self.upload.load(Ordering::Relaxed),
            total_download: self.download.load(Ordering::Relaxed),
            packets_up: self.packets_up.load(Ordering::Relaxed),
            packets_down: self.packets_down.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            active_sessions: per_session.len(),
            per_session,
        }
    }
}

fn action_label(session: &Session) -> &'static str {
    match session.action {
        crate::route::Action::Direct => "direct",
        crate::route::Action::Proxy(_) => "proxy",
        crate::route::Action::Block => "block",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IpProtocol;
    use crate::route::Action;

    fn session(id: SessionId) -> Session {
        Session::new(
            id,
            FlowKey::new(
                IpProtocol::Udp,
                format!("10.0.0.2:{}", 5000 + id).parse().unwrap(),
                "8.8.8.8:53".parse().unwrap(),
            ),
            Action::Direct,
        )
    }

    #[tokio::test]
    async fn test_record_and_snapshot() {
        let stats = StatsCollector::new();
        let a = session(1);
        let b = session(2);
        stats.session_opened(&a);
        stats.session_opened(&b);

        stats.record(&a, Direction::Upload, 100);
        stats.record(&a, Direction::Download, 400);
        stats.record(&b, Direction::Upload, 60);
        stats.record_malformed();
        stats.record_blocked();
        stats.record_dropped(DropReason::Oversize);

        let snap = stats.snapshot();
        assert_eq!(snap.total_upload, 160);
        assert_eq!(snap.total_download, 400);
        assert_eq!(snap.packets_up, 2);
        assert_eq!(snap.packets_down, 1);
        assert_eq!((snap.malformed, snap.blocked, snap.dropped), (1, 1, 1));
        assert_eq!(snap.active_sessions, 2);

        let a_stats = snap.per_session.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(a_stats.upload_bytes, 100);
        assert_eq!(a_stats.download_bytes, 400);
    }

    #[tokio::test]
    async fn test_closed_session_keeps_totals() {
        let stats = StatsCollector::new();
        let a = session(1);
        stats.session_opened(&a);
        stats.record(&a, Direction::Upload, 100);
        stats.session_closed(&a);
        stats.session_closed(&a);

        let snap = stats.snapshot();
        assert_eq!(snap.total_upload, 100);
        assert_eq!(snap.active_sessions, 0);
        assert!(snap.per_session.is_empty());
    }
}
