//! The proxy's routing table
//!
//! The connection-forwarding layer owns the real table; the coordination
//! engine only registers and retracts names through [`RoutingTable`].

use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Address registered for load-balanced groups so clients can request them
/// by name; connections are always redirected to a member before forwarding
pub const GROUP_PLACEHOLDER: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

#[cfg_attr(test, mockall::automock)]
pub trait RoutingTable: Send + Sync {
    fn register_address(&self, name: &str, address: SocketAddr);

    fn unregister_address(&self, name: &str);

    fn lookup_address(&self, name: &str) -> Option<SocketAddr>;

    /// Client sessions currently connected to `name`
    fn session_count(&self, name: &str) -> usize;
}

struct RoutedServer {
    address: SocketAddr,
    sessions: AtomicUsize,
}

/// In-process routing table with per-server session counters
#[derive(Default)]
pub struct MemoryRoutingTable {
    servers: DashMap<String, RoutedServer>,
}

impl MemoryRoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a client session on `name`; false if the name is unknown
    pub fn open_session(&self, name: &str) -> bool {
        self.servers
            .get(name)
            .map(|server| server.sessions.fetch_add(1, Ordering::AcqRel))
            .is_some()
    }

    pub fn close_session(&self, name: &str) {
        if let Some(server) = self.servers.get(name) {
            let _ = server
                .sessions
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl RoutingTable for MemoryRoutingTable {
    fn register_address(&self, name: &str, address: SocketAddr) {
        self.servers
            .entry(name.to_string())
            .and_modify(|server| server.address = address)
            .or_insert_with(|| RoutedServer {
                address,
                sessions: AtomicUsize::new(0),
            });
    }

    fn unregister_address(&self, name: &str) {
        self.servers.remove(name);
    }

    fn lookup_address(&self, name: &str) -> Option<SocketAddr> {
        self.servers.get(name).map(|server| server.address)
    }

    fn session_count(&self, name: &str) -> usize {
        self.servers
            .get(name)
            .map_or(0, |server| server.sessions.load(Ordering::Acquire))
    }
}
