//! Per-flow session state

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::common::{Direction, FlowKey};
use crate::packet::TcpFlags;
use crate::route::Action;

/// Session identifier, unique for the lifetime of a tunnel
pub type SessionId = u64;

/// TCP session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Open,
    /// FIN seen in at least one direction
    Closing,
    Closed,
}

/// Datagram session lifecycle (UDP and any other non-TCP protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Open,
    /// No activity since the previous sweep
    Idle,
}

/// Session state, tagged by transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Tcp(TcpState),
    Udp(UdpState),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Tcp(TcpState::Closed))
    }
}

struct StateCell {
    state: SessionState,
    fin_up: bool,
    fin_down: bool,
    closing_since: Option<Instant>,
}

/// Byte and packet counters for one session, per direction
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub packets_up: AtomicU64,
    pub packets_down: AtomicU64,
}

impl SessionCounters {
    pub fn add(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upload => {
                self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
                self.packets_up.fetch_add(1, Ordering::Relaxed);
            }
            Direction::Download => {
                self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
                self.packets_down.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A tracked flow.
///
/// Owned by the session table; everything else refers to it by id or holds
/// a short-lived `Arc`.
pub struct Session {
    pub id: SessionId,
    pub flow: FlowKey,
    /// Route decision taken when the session was created
    pub action: Action,
    pub created_at: Instant,
    last_active: Mutex<Instant>,
    active_since_sweep: AtomicBool,
    state: Mutex<StateCell>,
    in_flight: AtomicUsize,
    pub counters: Arc<SessionCounters>,
}

impl Session {
    pub fn new(id: SessionId, flow: FlowKey, action: Action) -> Self {
        let now = Instant::now();
        let state = if flow.is_tcp() {
            SessionState::Tcp(TcpState::Open)
        } else {
            SessionState::Udp(UdpState::Open)
        };
        Self {
            id,
            flow,
            action,
            created_at: now,
            last_active: Mutex::new(now),
            active_since_sweep: AtomicBool::new(true),
            state: Mutex::new(StateCell {
                state,
                fin_up: false,
                fin_down: false,
                closing_since: None,
            }),
            in_flight: AtomicUsize::new(0),
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// Update the last activity time to now
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
        self.active_since_sweep.store(true, Ordering::Relaxed);
        let mut cell = self.state.lock();
        if cell.state == SessionState::Udp(UdpState::Idle) {
            cell.state = SessionState::Udp(UdpState::Open);
        }
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Time since last activity, measured at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state
    }

    /// When the session entered the closing state
    pub fn closing_since(&self) -> Option<Instant> {
        self.state.lock().closing_since
    }

    /// Apply the TCP flags of a packet travelling in `direction` and return
    /// the resulting state.
    ///
    /// RST closes immediately. FIN moves an open session to closing; once
    /// both directions have sent FIN the session is closed.
    pub fn on_tcp_flags(&self, direction: Direction, flags: TcpFlags) -> SessionState {
        let mut cell = self.state.lock();
        if !matches!(cell.state, SessionState::Tcp(_)) || cell.state.is_closed() {
            return cell.state;
        }

        if flags.is_rst() {
            cell.state = SessionState::Tcp(TcpState::Closed);
            return cell.state;
        }

        if flags.is_fin() {
            match direction {
                Direction::Upload => cell.fin_up = true,
                Direction::Download => cell.fin_down = true,
            }
            if cell.fin_up && cell.fin_down {
                cell.state = SessionState::Tcp(TcpState::Closed);
            } else if cell.state == SessionState::Tcp(TcpState::Open) {
                cell.state = SessionState::Tcp(TcpState::Closing);
                cell.closing_since = Some(Instant::now());
            }
        }
        cell.state
    }

    /// Force the session into its terminal state
    pub fn mark_closed(&self) {
        let mut cell = self.state.lock();
        if let SessionState::Tcp(_) = cell.state {
            cell.state = SessionState::Tcp(TcpState::Closed);
        }
    }

    /// Called by the sweeper. Marks a datagram session idle when nothing
    /// touched it since the previous sweep.
    pub(crate) fn mark_swept(&self) {
        if !self.active_since_sweep.swap(false, Ordering::Relaxed) {
            let mut cell = self.state.lock();
            if cell.state == SessionState::Udp(UdpState::Open) {
                cell.state = SessionState::Udp(UdpState::Idle);
            }
        }
    }

    /// Whether a forward is currently in progress
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    /// Pin the session while a packet is being forwarded
    pub fn guard(self: &Arc<Self>) -> ForwardGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ForwardGuard {
            session: Arc::clone(self),
        }
    }

    pub fn bytes_up(&self) -> u64 {
        self.counters.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.counters.bytes_down.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("action", &self.action)
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps a session from being swept while a packet is in flight
pub struct ForwardGuard {
    session: Arc<Session>,
}

impl ForwardGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IpProtocol;

    fn tcp_session() -> Session {
        Session::new(
            1,
            FlowKey::new(
                IpProtocol::Tcp,
                "10.0.0.2:50000".parse().unwrap(),
                "93.184.216.34:443".parse().unwrap(),
            ),
            Action::Direct,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fin_both_directions_closes() {
        let session = tcp_session();
        let fin = TcpFlags(TcpFlags::FIN | TcpFlags::ACK);

        assert_eq!(
            session.on_tcp_flags(Direction::Upload, TcpFlags(TcpFlags::ACK)),
            SessionState::Tcp(TcpState::Open)
        );
        assert_eq!(
            session.on_tcp_flags(Direction::Upload, fin),
            SessionState::Tcp(TcpState::Closing)
        );
        assert!(session.closing_since().is_some());
        // A retransmitted FIN from the same side changes nothing
        assert_eq!(
            session.on_tcp_flags(Direction::Upload, fin),
            SessionState::Tcp(TcpState::Closing)
        );
        assert_eq!(
            session.on_tcp_flags(Direction::Download, fin),
            SessionState::Tcp(TcpState::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rst_closes_immediately() {
        let session = tcp_session();
        assert!(session
            .on_tcp_flags(Direction::Download, TcpFlags(TcpFlags::RST))
            .is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_idle_marking() {
        let session = Session::new(
            2,
            FlowKey::new(
                IpProtocol::Udp,
                "10.0.0.2:5000".parse().unwrap(),
                "8.8.8.8:53".parse().unwrap(),
            ),
            Action::Direct,
        );
        // Created since last sweep: stays open
        session.mark_swept();
        assert_eq!(session.state(), SessionState::Udp(UdpState::Open));
        session.mark_swept();
        assert_eq!(session.state(), SessionState::Udp(UdpState::Idle));
        session.touch();
        assert_eq!(session.state(), SessionState::Udp(UdpState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_guard_counts() {
        let session = Arc::new(tcp_session());
        assert!(!session.is_busy());
        let g1 = session.guard();
        let g2 = session.guard();
        assert!(session.is_busy());
        drop(g1);
        assert!(session.is_busy());
        drop(g2);
        assert!(!session.is_busy());
    }
}
