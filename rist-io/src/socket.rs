//! UDP socket wrapper for RIST
//!
//! Sockets are created and configured through socket2, then used through
//! the standard library's blocking `UdpSocket` with a read timeout so worker
//! threads can notice shutdown between datagrams.

use crate::transport::{BindOptions, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("Socket option not supported on this platform")]
    UnsupportedOption,
}

/// RIST socket wrapper
///
/// Wraps a UDP socket, optionally bound to an interface or joined to a
/// multicast group.
#[derive(Debug)]
pub struct RistSocket {
    inner: UdpSocket,
}

impl RistSocket {
    /// Create a socket bound to `addr`
    ///
    /// A multicast `addr` binds the port on the wildcard address and joins
    /// the group.
    pub fn bind(addr: SocketAddr, options: &BindOptions) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        if let Some(size) = options.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(miface) = options.miface.as_deref().filter(|s| !s.is_empty()) {
            bind_interface(&socket, miface)?;
        }

        let multicast = addr.ip().is_multicast();
        let bind_addr = if multicast {
            match addr.ip() {
                IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()),
                IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), addr.port()),
            }
        } else {
            addr
        };

        socket.bind(&bind_addr.into()).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => SocketError::AddressInUse(addr),
            _ => SocketError::Io(e),
        })?;

        if multicast {
            match addr.ip() {
                IpAddr::V4(group) => socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?,
                IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
            }
            debug!(group = %addr.ip(), "joined multicast group");
        }

        Ok(RistSocket {
            inner: socket.into(),
        })
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send a datagram
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive a datagram, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when the timeout expires.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        // A zero read timeout means "block forever" to the OS
        self.inner
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.inner.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(RistSocket {
            inner: self.inner.try_clone()?,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_interface(socket: &Socket, miface: &str) -> Result<(), SocketError> {
    socket.bind_device(Some(miface.as_bytes()))?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_interface(_socket: &Socket, _miface: &str) -> Result<(), SocketError> {
    Err(SocketError::UnsupportedOption)
}

impl Transport for RistSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        RistSocket::send_to(self, buf, target)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        RistSocket::recv_from(self, buf, timeout)
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        RistSocket::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_local() -> RistSocket {
        RistSocket::bind("127.0.0.1:0".parse().unwrap(), &BindOptions::default()).unwrap()
    }

    #[test]
    fn test_socket_creation() {
        let socket = bind_local();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = bind_local();
        let receiver = bind_local();
        let receiver_addr = receiver.local_addr().unwrap();

        let data = b"Hello, RIST!";
        sender.send_to(data, receiver_addr).unwrap();

        let mut buf = [0u8; 1024];
        let (n, from) = receiver
            .recv_from(&mut buf, Duration::from_secs(1))
            .unwrap()
            .expect("datagram within timeout");
        assert_eq!(&buf[..n], data);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_recv_timeout() {
        let socket = bind_local();
        let mut buf = [0u8; 64];
        let result = socket.recv_from(&mut buf, Duration::from_millis(20)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_socket_ipv6() {
        // May fail on systems without IPv6
        if let Ok(socket) = RistSocket::bind("[::1]:0".parse().unwrap(), &BindOptions::default()) {
            assert!(socket.local_addr().unwrap().is_ipv6());
        }
    }
}
