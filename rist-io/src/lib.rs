//! RIST I/O and Platform Abstraction
//!
//! This crate provides the datagram transports used by the session layer
//! (UDP sockets and an in-memory network for tests) and timing utilities
//! (NTP timestamps, timers, rate limiting).

pub mod memory;
pub mod socket;
pub mod time;
pub mod transport;

pub use memory::{Datagram, MemoryNetwork, MemorySocket};
pub use socket::{RistSocket, SocketError};
pub use time::{ntp_now, Clock, RateLimiter, Timer};
pub use transport::{BindOptions, Transport, TransportFactory, UdpFactory};
