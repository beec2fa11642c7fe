//! In-process datagram network
//!
//! `MemoryNetwork` stands in for UDP in tests: bound endpoints exchange
//! datagrams through crossbeam channels, and an optional filter sees every
//! datagram before delivery so a test can drop or count it. Delivery to an
//! address nobody is bound to silently succeeds, like UDP.

use crate::socket::SocketError;
use crate::transport::{BindOptions, Transport, TransportFactory};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// First port handed out for port-0 binds
const EPHEMERAL_START: u16 = 40_000;

/// A datagram in flight
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// Returns `true` to deliver the datagram, `false` to drop it
pub type Filter = dyn Fn(&Datagram) -> bool + Send + Sync;

struct NetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, Sender<(Bytes, SocketAddr)>>>,
    filter: RwLock<Option<Arc<Filter>>>,
    next_port: AtomicU16,
}

/// Shared in-memory network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            inner: Arc::new(NetworkInner {
                endpoints: RwLock::new(HashMap::new()),
                filter: RwLock::new(None),
                next_port: AtomicU16::new(EPHEMERAL_START),
            }),
        }
    }

    /// Install a filter that sees every datagram
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&Datagram) -> bool + Send + Sync + 'static,
    {
        *self.inner.filter.write() = Some(Arc::new(filter));
    }

    /// Deliver everything again
    pub fn clear_filter(&self) {
        *self.inner.filter.write() = None;
    }

    /// Bind an endpoint; port 0 picks a free port
    pub fn bind(&self, addr: SocketAddr) -> Result<MemorySocket, SocketError> {
        let mut addr = normalize(addr);
        let (tx, rx) = unbounded();

        let mut endpoints = self.inner.endpoints.write();
        if addr.port() == 0 {
            loop {
                let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
                if port == 0 {
                    return Err(SocketError::InvalidAddress);
                }
                let candidate = SocketAddr::new(addr.ip(), port);
                if !endpoints.contains_key(&candidate) {
                    addr = candidate;
                    break;
                }
            }
        } else if endpoints.contains_key(&addr) {
            return Err(SocketError::AddressInUse(addr));
        }
        endpoints.insert(addr, tx);

        Ok(MemorySocket {
            addr,
            rx,
            network: Arc::clone(&self.inner),
        })
    }

    /// Number of bound endpoints
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.read().len()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryNetwork {
    fn bind(
        &self,
        addr: SocketAddr,
        _options: &BindOptions,
    ) -> Result<Arc<dyn Transport>, SocketError> {
        Ok(Arc::new(MemoryNetwork::bind(self, addr)?))
    }
}

/// Wildcard binds and sends to the wildcard address map to loopback
fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}

/// Endpoint on a [`MemoryNetwork`]; unbinds on drop
pub struct MemorySocket {
    addr: SocketAddr,
    rx: Receiver<(Bytes, SocketAddr)>,
    network: Arc<NetworkInner>,
}

impl Transport for MemorySocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        let datagram = Datagram {
            from: self.addr,
            to: normalize(target),
            payload: Bytes::copy_from_slice(buf),
        };

        let filter = self.network.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(&datagram) {
                return Ok(buf.len());
            }
        }

        if let Some(tx) = self.network.endpoints.read().get(&datagram.to) {
            let _ = tx.send((datagram.payload, datagram.from));
        }
        Ok(buf.len())
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.rx.recv_timeout(timeout) {
            Ok((payload, from)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok(Some((n, from)))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.endpoints.write().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn test_send_recv() {
        let net = MemoryNetwork::new();
        let a = net.bind("127.0.0.1:5000".parse().unwrap()).unwrap();
        let b = net.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(b.local_addr().unwrap().port(), EPHEMERAL_START);

        b.send_to(b"hello", "127.0.0.1:5000".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf, WAIT).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, b.local_addr().unwrap());
    }

    #[test]
    fn test_wildcard_maps_to_loopback() {
        let net = MemoryNetwork::new();
        let listener = net.bind("0.0.0.0:6000".parse().unwrap()).unwrap();
        let client = net.bind("127.0.0.1:0".parse().unwrap()).unwrap();

        client.send_to(b"x", "127.0.0.1:6000".parse().unwrap()).unwrap();
        let mut buf = [0u8; 4];
        assert!(listener.recv_from(&mut buf, WAIT).unwrap().is_some());
    }

    #[test]
    fn test_address_in_use_and_unbind() {
        let net = MemoryNetwork::new();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let first = net.bind(addr).unwrap();
        assert!(matches!(net.bind(addr), Err(SocketError::AddressInUse(_))));

        drop(first);
        assert_eq!(net.endpoint_count(), 0);
        assert!(net.bind(addr).is_ok());
    }

    #[test]
    fn test_filter_drops_and_counts() {
        let net = MemoryNetwork::new();
        let a = net.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = net.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        net.set_filter(move |d| {
            counter.fetch_add(1, Ordering::SeqCst);
            d.payload.as_ref() != b"drop"
        });

        let to = b.local_addr().unwrap();
        a.send_to(b"drop", to).unwrap();
        a.send_to(b"keep", to).unwrap();

        let mut buf = [0u8; 8];
        let (n, _) = b.recv_from(&mut buf, WAIT).unwrap().unwrap();
        assert_eq!(&buf[..n], b"keep");
        assert!(b.recv_from(&mut buf, Duration::from_millis(20)).unwrap().is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        net.clear_filter();
        a.send_to(b"drop", to).unwrap();
        assert!(b.recv_from(&mut buf, WAIT).unwrap().is_some());
    }

    #[test]
    fn test_send_to_nowhere_succeeds() {
        let net = MemoryNetwork::new();
        let a = net.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(a.send_to(b"abc", "127.0.0.1:9".parse().unwrap()).unwrap(), 3);
    }
}
