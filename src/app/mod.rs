//! Application Layer
//!
//! This module contains:
//! - Tunnel: the packet router between the device and the multiplexers
//! - Controller: start/stop/status surface for the host
//! - Stats: traffic counters with Prometheus mirroring
//! - StatsApi: HTTP /metrics endpoint

mod controller;
pub mod metrics;
mod permission;
mod stats;
pub mod stats_api;
mod tunnel;

pub use controller::{
    ConnectionStats, InterfaceSettings, TunnelController, TunnelEvent, TunnelState, TunnelStatus,
    STOPPED_REASON,
};
pub use permission::{PermissionRequest, PermissionSlot};
pub use stats::{DropReason, SessionStats, StatsCollector, StatsSnapshot};
pub use tunnel::TunnelRouter;
