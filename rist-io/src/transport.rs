//! Datagram transport abstraction
//!
//! The session layer only needs to send a datagram to an address and to
//! receive one with a timeout. [`TransportFactory`] hides whether that is a
//! real UDP socket or the in-memory network used by tests.

use crate::socket::{RistSocket, SocketError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// A bound datagram endpoint
pub trait Transport: Send + Sync {
    /// Send one datagram
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError>;

    /// Receive one datagram, or `None` once `timeout` expires
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError>;

    fn local_addr(&self) -> Result<SocketAddr, SocketError>;
}

/// Options applied when binding a transport
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Interface to bind to (multicast interface selection)
    pub miface: Option<String>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

/// Creates bound transports
pub trait TransportFactory: Send + Sync {
    fn bind(
        &self,
        addr: SocketAddr,
        options: &BindOptions,
    ) -> Result<Arc<dyn Transport>, SocketError>;
}

/// Factory for real UDP sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpFactory;

impl TransportFactory for UdpFactory {
    fn bind(
        &self,
        addr: SocketAddr,
        options: &BindOptions,
    ) -> Result<Arc<dyn Transport>, SocketError> {
        Ok(Arc::new(RistSocket::bind(addr, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_factory() {
        let factory = UdpFactory;
        let a = factory
            .bind("127.0.0.1:0".parse().unwrap(), &BindOptions::default())
            .unwrap();
        let b = factory
            .bind("127.0.0.1:0".parse().unwrap(), &BindOptions::default())
            .unwrap();

        a.send_to(b"ping", b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = b
            .recv_from(&mut buf, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
