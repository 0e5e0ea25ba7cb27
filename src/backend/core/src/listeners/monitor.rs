//! Read-only view of a listener group for diagnostics and tests.

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::descriptor::ListenerDescriptor;

/// Lifecycle of the whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Registered, socket not bound yet
    Idle,
    /// Not bound because the descriptor is disabled
    Disabled,
    Serving,
    /// Socket closed, waiting for open connections to finish
    Draining,
    Stopped,
}

/// Live counters for one listener, shared between its serve task and the monitor.
#[derive(Debug)]
pub struct ListenerStats {
    descriptor: ListenerDescriptor,
    state: RwLock<ListenerState>,
    bound_address: RwLock<Option<SocketAddr>>,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    forced_closures: AtomicU64,
    close_count: AtomicU64,
    unexpectedly_stopped: AtomicBool,
}

impl ListenerStats {
    pub(crate) fn new(descriptor: ListenerDescriptor) -> Self {
        let state = if descriptor.enabled {
            ListenerState::Idle
        } else {
            ListenerState::Disabled
        };
        Self {
            descriptor,
            state: RwLock::new(state),
            bound_address: RwLock::new(None),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            forced_closures: AtomicU64::new(0),
            close_count: AtomicU64::new(0),
            unexpectedly_stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ListenerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    pub fn bound_address(&self) -> Option<SocketAddr> {
        *self.bound_address.read()
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> u64 {
        self.close_count.load(Ordering::Acquire)
    }

    pub fn unexpectedly_stopped(&self) -> bool {
        self.unexpectedly_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        *self.state.write() = state;
    }

    pub(crate) fn set_bound(&self, address: SocketAddr) {
        *self.bound_address.write() = Some(address);
        self.set_state(ListenerState::Serving);
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn record_forced(&self, count: u64) {
        self.forced_closures.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn record_socket_closed(&self) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn flag_unexpected_stop(&self) {
        self.unexpectedly_stopped.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            name: self.descriptor.name.clone(),
            enabled: self.descriptor.enabled,
            configured_address: self.descriptor.address(),
            bound_address: self.bound_address(),
            state: self.state(),
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Acquire),
            forced_closures: self.forced_closures.load(Ordering::Acquire),
            close_count: self.close_count(),
            unexpectedly_stopped: self.unexpectedly_stopped(),
        }
    }
}

/// Point-in-time copy of one listener's stats.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub name: String,
    pub enabled: bool,
    pub configured_address: String,
    pub bound_address: Option<SocketAddr>,
    pub state: ListenerState,
    pub active_connections: u64,
    pub total_connections: u64,
    pub forced_closures: u64,
    pub close_count: u64,
    pub unexpectedly_stopped: bool,
}

/// Point-in-time copy of the group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub state: GroupState,
    pub listeners: Vec<ListenerSnapshot>,
}

impl GroupSnapshot {
    pub fn listener(&self, name: &str) -> Option<&ListenerSnapshot> {
        self.listeners.iter().find(|l| l.name == name)
    }
}

/// Shared monitor of a listener group.
#[derive(Debug)]
pub struct GroupMonitor {
    state: RwLock<GroupState>,
    listeners: RwLock<Vec<Arc<ListenerStats>>>,
}

impl GroupMonitor {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(GroupState::Created),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> GroupState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: GroupState) {
        *self.state.write() = state;
    }

    pub(crate) fn register(&self, stats: Arc<ListenerStats>) {
        self.listeners.write().push(stats);
    }

    /// Stats of the named listener.
    pub fn listener(&self, name: &str) -> Option<Arc<ListenerStats>> {
        self.listeners
            .read()
            .iter()
            .find(|l| l.name() == name)
            .cloned()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            state: self.state(),
            listeners: self.listeners.read().iter().map(|l| l.snapshot()).collect(),
        }
    }
}
