//! Bound transports and their receive loops
//!
//! Every configured peer owns one [`Endpoint`]. An initiating peer's
//! endpoint feeds the peer's own link; a listening endpoint admits each new
//! remote as a client link, subject to the auth handler.

use crate::context::{Shared, TIMER_TICK};
use crate::events::{AuthRequest, ConnectionEvent};
use crate::error::Result;
use crate::link::{Link, LinkKind};
use bytes::Bytes;
use parking_lot::Mutex;
use rist_io::{ntp_now, Transport};
use rist_protocol::{
    ControlPacket, ControlType, DataBlock, DataFlags, DataPacket, OobBlock, Packet, PeerConfig,
    PeerId, Profile, TimingMode,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// How long one receive call blocks before the loop rechecks for shutdown
const RECV_POLL: Duration = Duration::from_millis(20);

/// One bound transport
pub(crate) struct Endpoint {
    /// The configured peer this endpoint belongs to
    pub(crate) peer: PeerId,
    pub(crate) config: PeerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) listening: bool,
    /// Clients of a listening endpoint, by remote address
    pub(crate) clients: Mutex<HashMap<SocketAddr, PeerId>>,
    /// Remotes refused by the auth hook, until the given instant
    rejected: Mutex<HashMap<SocketAddr, Instant>>,
    closed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub(crate) fn new(
        peer: PeerId,
        config: PeerConfig,
        transport: Arc<dyn Transport>,
        listening: bool,
    ) -> Self {
        Endpoint {
            peer,
            config,
            transport,
            listening,
            clients: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the receive loop to stop
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Wait for the receive loop, unless called from it
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Whether `remote` is inside its rejection cooldown
    fn is_rejected(&self, remote: SocketAddr, now: Instant) -> bool {
        let mut rejected = self.rejected.lock();
        match rejected.get(&remote) {
            Some(until) if *until > now => true,
            Some(_) => {
                rejected.remove(&remote);
                false
            }
            None => false,
        }
    }

    /// Refuse `remote` until `until`, forgetting cooldowns that ran out
    fn reject(&self, remote: SocketAddr, now: Instant, until: Instant) {
        let mut rejected = self.rejected.lock();
        rejected.retain(|_, expiry| *expiry > now);
        rejected.insert(remote, until);
    }

    fn local_addr(&self) -> SocketAddr {
        self.transport
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }
}

/// Spawn the receive loop of `endpoint` if it is not running yet
pub(crate) fn start(shared: &Arc<Shared>, endpoint: &Arc<Endpoint>) -> Result<()> {
    let mut thread = endpoint.thread.lock();
    if thread.is_some() {
        return Ok(());
    }
    let ep = Arc::clone(endpoint);
    let name = format!("rist-recv-{}", endpoint.peer.as_u32());
    *thread = Some(shared.spawn(name, move |shared| run(shared, ep))?);
    Ok(())
}

fn run(shared: Arc<Shared>, endpoint: Arc<Endpoint>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    debug!(peer = %endpoint.peer, local = %endpoint.local_addr(), "receive loop started");

    while !endpoint.is_closed() && !shared.is_stopping() {
        match endpoint.transport.recv_from(&mut buf, RECV_POLL) {
            Ok(Some((len, from))) => {
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                on_datagram(&shared, &endpoint, datagram, from, Instant::now());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %endpoint.peer, error = %e, "receive failed");
                thread::sleep(RECV_POLL);
            }
        }
    }

    debug!(peer = %endpoint.peer, "receive loop stopped");
}

fn on_datagram(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    datagram: Bytes,
    from: SocketAddr,
    now: Instant,
) {
    let packet = match Packet::from_bytes(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!(%from, error = %e, "dropping malformed packet");
            return;
        }
    };

    let Some(link) = resolve_link(shared, endpoint, from, now) else {
        return;
    };

    let first_contact = {
        let mut peer = link.peer.lock();
        let first = peer.on_activity(now);
        if first {
            peer.establish();
        }
        first
    };
    if first_contact {
        let event = if link.is_client() {
            ConnectionEvent::ClientConnected
        } else {
            ConnectionEvent::Established
        };
        info!(peer = %link.id(), remote = %from, "{event}");
        shared.emit(link.id(), event);
    }
    link.counters.received.fetch_add(1, Ordering::Relaxed);

    match packet {
        Packet::Data(data) => on_data(shared, &link, data, now),
        Packet::Control(control) => on_control(shared, &link, control, now),
    }
}

/// Find the link a datagram belongs to, admitting new clients
fn resolve_link(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    from: SocketAddr,
    now: Instant,
) -> Option<Arc<Link>> {
    if !endpoint.listening {
        return shared.group.get(endpoint.peer);
    }

    let known = endpoint.clients.lock().get(&from).copied();
    if let Some(id) = known {
        if let Some(link) = shared.group.get(id) {
            return Some(link);
        }
        endpoint.clients.lock().remove(&from);
    }

    if endpoint.is_rejected(from, now) {
        trace!(%from, "remote in rejection cooldown");
        return None;
    }
    admit(shared, endpoint, from, now)
}

fn admit(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    from: SocketAddr,
    now: Instant,
) -> Option<Arc<Link>> {
    let id = shared.next_peer_id();
    let link = Link::new(
        id,
        LinkKind::Client {
            listener: endpoint.peer,
        },
        endpoint.config.clone(),
        from,
        Arc::clone(&endpoint.transport),
        shared.stats_interval(),
        now,
    );
    let link = match link {
        Ok(link) => Arc::new(link),
        Err(e) => {
            warn!(%from, error = %e, "cannot set up client");
            return None;
        }
    };

    if let Some(auth) = shared.auth_handler() {
        let request = AuthRequest {
            peer: id,
            listener: endpoint.peer,
            remote: from,
            local: endpoint.local_addr(),
        };
        if !(auth.connect)(&request) {
            link.peer.lock().reject();
            info!(%from, listener = %endpoint.peer, "client refused by auth handler");
            endpoint.reject(from, now, now + endpoint.config.session_timeout());
            return None;
        }
    }

    if let Err(e) = shared.group.add(Arc::clone(&link)) {
        warn!(%from, error = %e, "cannot admit client");
        return None;
    }
    endpoint.clients.lock().insert(from, id);
    debug!(peer = %id, %from, listener = %endpoint.peer, "client admitted");
    Some(link)
}

fn on_data(shared: &Arc<Shared>, link: &Arc<Link>, data: DataPacket, now: Instant) {
    let Some(receiver) = &shared.receiver else {
        trace!(peer = %link.id(), "sender ignoring data packet");
        return;
    };

    let seq = data.seq;
    let Some(payload) = link.open_payload(data.flow_id, seq.as_raw(), data.payload) else {
        return;
    };
    let ts_ntp = match link.config.timing_mode {
        TimingMode::Arrival => ntp_now(),
        TimingMode::Source | TimingMode::Rtc => data.ts_ntp,
    };
    let block = DataBlock {
        payload,
        ts_ntp,
        virt_src_port: data.virt_src_port,
        virt_dst_port: data.virt_dst_port,
        peer: Some(link.id()),
        flow_id: data.flow_id,
        seq: seq.as_raw() as u64,
        flags: DataFlags::NONE,
    };
    receiver.deliver(shared, link, seq, block, data.retransmitted, now);
}

fn on_control(shared: &Arc<Shared>, link: &Arc<Link>, control: ControlPacket, now: Instant) {
    match control.control_type {
        ControlType::Keepalive => {
            if let Ok(cname) = control.keepalive_cname() {
                if !cname.is_empty() {
                    link.peer.lock().set_remote_cname(cname);
                }
            }
        }
        ControlType::EchoRequest => {
            if let Ok(echo) = control.echo_timestamp() {
                let reply = ControlPacket::echo_response(shared.flow_id(), ntp_now(), echo);
                let _ = link.send_control(&reply);
            }
        }
        ControlType::EchoResponse => {
            if let Ok(echo) = control.echo_timestamp() {
                let sample = shared.clock.elapsed_since_us(echo, now);
                link.peer.lock().on_rtt_sample(sample);
                trace!(peer = %link.id(), rtt_us = sample.as_micros() as u64, "rtt sample");
            }
        }
        ControlType::NackRange | ControlType::NackBitmask => {
            let Some(sender) = &shared.sender else {
                return;
            };
            match control.nack_info() {
                Ok(info) => {
                    trace!(peer = %link.id(), count = info.seq_count(), "nack received");
                    sender.on_nack(link, &info, TIMER_TICK, now);
                }
                Err(e) => debug!(peer = %link.id(), error = %e, "malformed nack"),
            }
        }
        ControlType::Oob => {
            if shared.profile == Profile::Simple {
                return;
            }
            shared.oob.push(OobBlock {
                peer: link.id(),
                payload: control.body,
                ts_ntp: control.timestamp,
            });
        }
        ControlType::Shutdown => {
            info!(peer = %link.id(), remote = %link.remote(), "remote shut down");
            link.peer.lock().disconnect();
            if link.is_client() {
                shared.remove_client(link);
                if let Some(auth) = shared.auth_handler() {
                    (auth.disconnect)(link.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rist_io::MemoryNetwork;

    fn endpoint(net: &MemoryNetwork) -> Endpoint {
        let socket = net.bind("127.0.0.1:9800".parse().unwrap()).unwrap();
        Endpoint::new(
            PeerId::new(1),
            PeerConfig::new("127.0.0.1:9800"),
            Arc::new(socket),
            true,
        )
    }

    #[test]
    fn test_rejection_cooldown() {
        let net = MemoryNetwork::new();
        let endpoint = endpoint(&net);
        let now = Instant::now();
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        endpoint.reject(remote, now, now + Duration::from_millis(100));
        assert!(endpoint.is_rejected(remote, now + Duration::from_millis(50)));
        assert!(!endpoint.is_rejected(remote, now + Duration::from_millis(100)));
    }

    #[test]
    fn test_expired_rejections_are_swept() {
        let net = MemoryNetwork::new();
        let endpoint = endpoint(&net);
        let now = Instant::now();
        let cooldown = Duration::from_millis(100);

        for port in 5000..5100u16 {
            let remote = SocketAddr::from(([10, 0, 0, 1], port));
            endpoint.reject(remote, now, now + cooldown);
        }
        assert_eq!(endpoint.rejected.lock().len(), 100);

        let later = now + cooldown * 2;
        let last = SocketAddr::from(([10, 0, 0, 2], 6000));
        endpoint.reject(last, later, later + cooldown);
        let rejected = endpoint.rejected.lock();
        assert_eq!(rejected.len(), 1);
        assert!(rejected.contains_key(&last));
    }
}
