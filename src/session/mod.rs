//! Session Table
//!
//! Responsibilities:
//! - Map each flow to exactly one session
//! - Track per-session state and activity
//! - Evict idle and finished sessions
//!
//! ```text
//!              flows                     sessions
//!   FlowKey ──────────▶ SessionId ──────────────▶ Arc<Session>
//! ```
//!
//! Both maps are `DashMap`s so the device loop, the return-path loops and
//! the sweeper can work concurrently. No lock is held across I/O.

mod state;

pub use state::{
    ForwardGuard, Session, SessionCounters, SessionId, SessionState, TcpState, UdpState,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::common::FlowKey;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::packet::ParsedPacket;
use crate::route::Action;

/// Session table limits and timeouts
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub udp_idle_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub tcp_close_grace: Duration,
    pub max_sessions: usize,
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            udp_idle_timeout: config.udp_idle_timeout(),
            tcp_idle_timeout: config.tcp_idle_timeout(),
            tcp_close_grace: config.tcp_close_grace(),
            max_sessions: config.max_sessions,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Whether a packet may open a new session.
///
/// A lone RST never does; any other TCP segment does, even without SYN, so
/// connections that predate the tunnel can be picked up.
pub fn opens_session(packet: &ParsedPacket) -> bool {
    match packet.tcp() {
        Some(tcp) => !tcp.flags.is_rst(),
        None => true,
    }
}

/// Attempts at pinning a session for a flow before giving up
const PIN_ATTEMPTS: usize = 3;

/// Concurrent flow → session map
pub struct SessionTable {
    flows: DashMap<FlowKey, SessionId>,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    limits: SessionLimits,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            flows: DashMap::new(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Return the session for `flow`, creating it with `action` if absent.
    ///
    /// Atomic per flow: concurrent callers with the same key get the same
    /// session, and exactly one of them sees `created == true`.
    pub fn get_or_create(&self, flow: FlowKey, action: Action) -> Result<(Arc<Session>, bool)> {
        match self.flows.entry(flow) {
            Entry::Occupied(mut entry) => {
                if let Some(session) = self.sessions.get(entry.get()) {
                    return Ok((session.clone(), false));
                }
                // Session removed between the two maps; replace the stale id
                let session = self.create(flow, action)?;
                entry.insert(session.id);
                Ok((session, true))
            }
            Entry::Vacant(entry) => {
                let session = self.create(flow, action)?;
                entry.insert(session.id);
                Ok((session, true))
            }
        }
    }

    /// Like `get_or_create`, but returns the session pinned against eviction.
    ///
    /// The guard is only handed out once the session is confirmed to still be
    /// in the table, so a sweep that raced the lookup can't strand the caller
    /// on an evicted session.
    pub fn get_or_create_pinned(
        &self,
        flow: FlowKey,
        action: Action,
    ) -> Result<(ForwardGuard, bool)> {
        let mut created_any = false;
        for _ in 0..PIN_ATTEMPTS {
            let (session, created) = self.get_or_create(flow, action.clone())?;
            created_any |= created;
            let guard = session.guard();
            if self.is_current(&session) {
                return Ok((guard, created_any));
            }
            trace!("[Session] #{} evicted while pinning, retrying", session.id);
        }
        Err(Error::ConnectionClosed)
    }

    /// Pin a live session by id
    pub fn pin(&self, id: SessionId) -> Option<ForwardGuard> {
        let session = self.get(id)?;
        let guard = session.guard();
        self.is_current(&session).then_some(guard)
    }

    /// Pin the live session for `flow`, if any
    pub fn pin_flow(&self, flow: &FlowKey) -> Option<ForwardGuard> {
        let id = *self.flows.get(flow)?;
        self.pin(id)
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .get(&session.id)
            .is_some_and(|s| Arc::ptr_eq(s.value(), session))
    }

    fn create(&self, flow: FlowKey, action: Action) -> Result<Arc<Session>> {
        if self.sessions.len() >= self.limits.max_sessions {
            return Err(Error::SessionLimit(self.limits.max_sessions));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, flow, action));
        self.sessions.insert(id, session.clone());
        debug!("[Session] #{} opened: {} ({})", id, flow, session.action);
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn lookup(&self, flow: &FlowKey) -> Option<Arc<Session>> {
        let id = *self.flows.get(flow)?;
        self.get(id)
    }

    /// Record activity on a session
    pub fn touch(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Close and remove a session, returning it if it was present
    pub fn close(&self, id: SessionId, reason: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        Some(self.finish(session, reason))
    }

    fn finish(&self, session: Arc<Session>, reason: &str) -> Arc<Session> {
        let id = session.id;
        self.flows.remove_if(&session.flow, |_, v| *v == id);
        session.mark_closed();
        debug!(
            "[Session] #{} closed: {} ({}, up {} down {})",
            id,
            session.flow,
            reason,
            session.bytes_up(),
            session.bytes_down()
        );
        session
    }

    /// Evict sessions that are finished or idle past their timeout.
    ///
    /// Sessions with a forward in progress are skipped. Returns the evicted
    /// sessions so their transport resources can be released.
    pub fn sweep_idle(&self, now: Instant) -> Vec<Arc<Session>> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            session.mark_swept();
            if session.is_busy() {
                continue;
            }
            if let Some(reason) = self.expiry_reason(session, now) {
                expired.push((session.id, reason));
            }
        }

        let mut evicted = Vec::with_capacity(expired.len());
        for (id, reason) in expired {
            // Re-check under the shard lock: the session may have been touched
            // or pinned since the scan, and a pin taken after this removal
            // sees the session gone
            let removed = self.sessions.remove_if(&id, |_, s| {
                !s.is_busy() && self.expiry_reason(s, now).is_some()
            });
            if let Some((_, session)) = removed {
                evicted.push(self.finish(session, reason));
            }
        }

        if !evicted.is_empty() {
            trace!(
                "[Session] Sweep evicted {} sessions, {} remain",
                evicted.len(),
                self.len()
            );
        }
        evicted
    }

    fn expiry_reason(&self, session: &Session, now: Instant) -> Option<&'static str> {
        let idle = session.idle_for(now);
        match session.state() {
            SessionState::Tcp(TcpState::Closed) => Some("closed"),
            SessionState::Tcp(TcpState::Closing) => {
                let since = session.closing_since().unwrap_or(session.created_at);
                if now.saturating_duration_since(since) >= self.limits.tcp_close_grace {
                    Some("close grace elapsed")
                } else {
                    None
                }
            }
            SessionState::Tcp(TcpState::Open) => {
                (idle > self.limits.tcp_idle_timeout).then_some("tcp idle")
            }
            SessionState::Udp(_) => (idle > self.limits.udp_idle_timeout).then_some("udp idle"),
        }
    }

    /// Remove every session, returning them
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.close(id, "tunnel stopped"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Direction, IpProtocol};
    use crate::packet::{parse, PacketBuilder, TcpFlags};

    fn udp_flow(sport: u16) -> FlowKey {
        FlowKey::new(
            IpProtocol::Udp,
            format!("10.0.0.2:{}", sport).parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        )
    }

    fn tcp_flow(sport: u16) -> FlowKey {
        FlowKey::new(
            IpProtocol::Tcp,
            format!("10.0.0.2:{}", sport).parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_flow_same_session() {
        let table = SessionTable::default();
        let (a, created_a) = table.get_or_create(udp_flow(5000), Action::Direct).unwrap();
        let (b, created_b) = table.get_or_create(udp_flow(5000), Action::Block).unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.id, b.id);
        // The first decision sticks
        assert_eq!(b.action, Action::Direct);

        let (c, _) = table.get_or_create(udp_flow(5001), Action::Direct).unwrap();
        assert_ne!(a.id, c.id);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(&udp_flow(5000)).unwrap().id, a.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_get_or_create_creates_once() {
        let table = Arc::new(SessionTable::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.get_or_create(udp_flow(7000), Action::Direct).unwrap()
            }));
        }
        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let (session, was_created) = handle.await.unwrap();
            ids.insert(session.id);
            created += was_created as usize;
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_removes_both_mappings() {
        let table = SessionTable::default();
        let (s, _) = table.get_or_create(tcp_flow(1), Action::Direct).unwrap();
        let removed = table.close(s.id, "test").unwrap();
        assert!(removed.state().is_closed());
        assert!(table.get(s.id).is_none());
        assert!(table.lookup(&tcp_flow(1)).is_none());
        assert!(table.close(s.id, "again").is_none());
        assert!(!table.touch(s.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_idle_sweep_timing() {
        let table = SessionTable::default();
        let (kept, _) = table.get_or_create(udp_flow(1), Action::Direct).unwrap();
        let (idle, _) = table.get_or_create(udp_flow(2), Action::Direct).unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        table.touch(kept.id);

        // Exactly at the timeout the session is still alive
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(table.sweep_idle(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let evicted = table.sweep_idle(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, idle.id);
        assert!(table.get(kept.id).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        let evicted = table.sweep_idle(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_not_evicted_early() {
        let table = SessionTable::default();
        table.get_or_create(udp_flow(1), Action::Direct).unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(table.sweep_idle(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.sweep_idle(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_guarded_sessions() {
        let table = SessionTable::default();
        let (s, _) = table.get_or_create(udp_flow(1), Action::Direct).unwrap();
        let guard = s.guard();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(table.sweep_idle(Instant::now()).is_empty());
        drop(guard);
        assert_eq!(table.sweep_idle(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_refuses_evicted_session() {
        let table = SessionTable::default();
        let (stale, _) = table.get_or_create(udp_flow(1), Action::Direct).unwrap();

        // The sweeper wins the race: the caller still holds the old Arc
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(table.sweep_idle(Instant::now()).len(), 1);
        assert!(table.pin(stale.id).is_none());
        assert!(table.pin_flow(&udp_flow(1)).is_none());

        // Pinning through the flow opens a fresh session instead
        let (guard, created) = table
            .get_or_create_pinned(udp_flow(1), Action::Direct)
            .unwrap();
        assert!(created);
        assert_ne!(guard.session().id, stale.id);
        assert!(table.pin_flow(&udp_flow(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_session_survives_concurrent_sweeps() {
        let table = Arc::new(SessionTable::default());
        // Far enough ahead that every unpinned session is expired
        let later = Instant::now() + Duration::from_secs(3600);

        let sweeper = {
            let table = table.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    table.sweep_idle(later);
                }
            })
        };
        for _ in 0..1000 {
            let (guard, _) = table
                .get_or_create_pinned(udp_flow(1), Action::Direct)
                .unwrap();
            // Whatever the sweeper does, a pinned session stays in the table
            assert!(table.get(guard.session().id).is_some());
        }
        sweeper.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_closing_grace_and_closed() {
        let table = SessionTable::default();
        let (closing, _) = table.get_or_create(tcp_flow(1), Action::Direct).unwrap();
        let (closed, _) = table.get_or_create(tcp_flow(2), Action::Direct).unwrap();
        let (open, _) = table.get_or_create(tcp_flow(3), Action::Direct).unwrap();

        let fin = TcpFlags(TcpFlags::FIN | TcpFlags::ACK);
        closing.on_tcp_flags(Direction::Upload, fin);
        closed.on_tcp_flags(Direction::Upload, TcpFlags(TcpFlags::RST));

        // Closed sessions go at the next sweep
        let evicted = table.sweep_idle(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, closed.id);

        tokio::time::advance(Duration::from_secs(10)).await;
        let evicted = table.sweep_idle(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, closing.id);

        // Open TCP survives well past the UDP timeout
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(table.sweep_idle(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(table.sweep_idle(Instant::now())[0].id, open.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_limit() {
        let table = SessionTable::new(SessionLimits {
            max_sessions: 2,
            ..Default::default()
        });
        table.get_or_create(udp_flow(1), Action::Direct).unwrap();
        table.get_or_create(udp_flow(2), Action::Direct).unwrap();
        assert!(matches!(
            table.get_or_create(udp_flow(3), Action::Direct),
            Err(Error::SessionLimit(2))
        ));
        // Existing flows still resolve
        assert!(table.get_or_create(udp_flow(1), Action::Direct).is_ok());
    }

    #[test]
    fn test_lone_rst_does_not_open() {
        let src = "10.0.0.2:50000".parse().unwrap();
        let dst = "93.184.216.34:443".parse().unwrap();
        let rst = PacketBuilder::tcp(src, dst, 1, 0, TcpFlags(TcpFlags::RST), 0, &[]).unwrap();
        let ack = PacketBuilder::tcp(src, dst, 1, 1, TcpFlags(TcpFlags::ACK), 0, &[]).unwrap();
        assert!(!opens_session(&parse(rst).unwrap()));
        assert!(opens_session(&parse(ack).unwrap()));
    }
}
