//! RIST Peer State Machine
//!
//! Tracks one remote endpoint from first contact through establishment to
//! timeout or disconnection:
//!
//! ```text
//! Connecting ──activity──> Established ──silence──> TimedOut
//!     │                        │                      │
//!     └──reject──┐             └──shutdown/destroy──┐ └──activity──> Established
//!                v                                  v
//!           Disconnected <──────────────────── Disconnected
//! ```
//!
//! The machine only decides; sending keepalives and raising events is left
//! to the session layer.

use crate::config::PeerConfig;
use crate::nack::RttEstimator;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of a peer within one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u32);

impl PeerId {
    pub const fn new(id: u32) -> Self {
        PeerId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Configured, nothing heard from the remote yet
    Connecting,
    /// Traffic seen within the session timeout
    Established,
    /// Silent for longer than the session timeout
    TimedOut,
    /// Shut down locally, by the remote, or rejected by the auth hook
    Disconnected,
}

/// One remote endpoint
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    state: PeerState,
    last_activity: Instant,
    last_keepalive: Option<Instant>,
    session_timeout: Duration,
    keepalive_interval: Duration,
    rtt: RttEstimator,
    remote_cname: Option<String>,
}

impl Peer {
    /// Create a peer in the `Connecting` state
    pub fn new(id: PeerId, config: &PeerConfig, now: Instant) -> Self {
        Peer {
            id,
            state: PeerState::Connecting,
            last_activity: now,
            last_keepalive: None,
            session_timeout: config.session_timeout(),
            keepalive_interval: config.keepalive_interval(),
            rtt: RttEstimator::new(config.rtt_min(), config.rtt_max()),
            remote_cname: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Record inbound traffic
    ///
    /// Returns `true` when the peer is not established yet and the caller
    /// should run admission and then [`Peer::establish`] or [`Peer::reject`].
    pub fn on_activity(&mut self, now: Instant) -> bool {
        if self.state == PeerState::Disconnected {
            return false;
        }
        self.last_activity = now;
        self.state != PeerState::Established
    }

    /// Move to `Established`
    pub fn establish(&mut self) {
        if self.state != PeerState::Disconnected {
            self.state = PeerState::Established;
        }
    }

    /// Refuse the peer; it never becomes established
    pub fn reject(&mut self) {
        self.state = PeerState::Disconnected;
    }

    /// Mark the peer as gone
    pub fn disconnect(&mut self) {
        self.state = PeerState::Disconnected;
    }

    /// Check the session timeout
    ///
    /// Returns `true` exactly once per silence: on the transition from
    /// `Established` to `TimedOut`.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.state == PeerState::Established
            && now.saturating_duration_since(self.last_activity) >= self.session_timeout
        {
            self.state = PeerState::TimedOut;
            return true;
        }
        false
    }

    /// Check whether a keepalive should go out now, and note it as sent
    pub fn keepalive_due(&mut self, now: Instant) -> bool {
        if self.state == PeerState::Disconnected {
            return false;
        }
        let due = match self.last_keepalive {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.keepalive_interval,
        };
        if due {
            self.last_keepalive = Some(now);
        }
        due
    }

    /// Feed a round-trip measurement
    pub fn on_rtt_sample(&mut self, sample: Duration) {
        self.rtt.update(sample);
    }

    /// Smoothed RTT clamped to the configured bounds
    pub fn rtt(&self) -> Duration {
        self.rtt.clamped_srtt()
    }

    /// Raw smoothed RTT
    pub fn raw_rtt(&self) -> Duration {
        self.rtt.srtt()
    }

    /// Peer is established and may carry data
    pub fn is_live(&self) -> bool {
        self.state == PeerState::Established
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn remote_cname(&self) -> Option<&str> {
        self.remote_cname.as_deref()
    }

    pub fn set_remote_cname(&mut self, cname: String) {
        self.remote_cname = Some(cname);
    }
}
