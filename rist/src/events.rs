//! Connection events and application hooks

use rist_protocol::{DataBlock, OobBlock, PeerId, StatsSnapshot};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Peer connection status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A configured (initiating) peer heard from its remote
    Established,
    /// A configured peer went silent past its session timeout
    TimedOut,
    /// A remote connected to a listening peer
    ClientConnected,
    /// A connected client went silent past its session timeout
    ClientTimedOut,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEvent::Established => "established",
            ConnectionEvent::TimedOut => "timed out",
            ConnectionEvent::ClientConnected => "client connected",
            ConnectionEvent::ClientTimedOut => "client timed out",
        };
        f.write_str(name)
    }
}

/// A remote asking to become a peer of a listening endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Id the peer will have if accepted
    pub peer: PeerId,
    /// The configured listening peer it connected to
    pub listener: PeerId,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

pub type DataCallback = Arc<dyn Fn(DataBlock) + Send + Sync>;
pub type OobCallback = Arc<dyn Fn(OobBlock) + Send + Sync>;
pub type StatsCallback = Arc<dyn Fn(StatsSnapshot) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(PeerId, ConnectionEvent) + Send + Sync>;

/// Admission hook for listening peers
///
/// `connect` returns `false` to refuse the remote; `disconnect` runs when
/// an admitted client goes away.
#[derive(Clone)]
pub struct AuthHandler {
    pub connect: Arc<dyn Fn(&AuthRequest) -> bool + Send + Sync>,
    pub disconnect: Arc<dyn Fn(PeerId) + Send + Sync>,
}

impl AuthHandler {
    pub fn new<C, D>(connect: C, disconnect: D) -> Self
    where
        C: Fn(&AuthRequest) -> bool + Send + Sync + 'static,
        D: Fn(PeerId) + Send + Sync + 'static,
    {
        AuthHandler {
            connect: Arc::new(connect),
            disconnect: Arc::new(disconnect),
        }
    }
}

impl fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHandler").finish_non_exhaustive()
    }
}
