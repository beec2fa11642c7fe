//! Peers as seen by a context
//!
//! A [`Link`] is one remote endpoint that carries traffic: either a
//! configured peer that initiates towards its address, or a client that
//! connected to a listening peer.

use crate::error::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use rist_bonding::Member;
use rist_crypto::{AesGcmCipher, KeySize, PacketCipher};
use rist_io::{SocketError, Transport};
use rist_protocol::{
    CongestionController, ControlPacket, DataPacket, Peer, PeerConfig, PeerId, PeerState,
    RetransmitCounters, RetransmitQueue,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

type SendResult = std::result::Result<(), SocketError>;

/// How a link came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Configured peer that sends towards its address
    Initiator,
    /// Remote that connected to the listening peer `listener`
    Client { listener: PeerId },
}

/// Traffic counters, reset each statistics interval
#[derive(Debug, Default)]
pub(crate) struct LinkCounters {
    /// Original data packets
    pub sent: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub retry_bytes: AtomicU64,
    pub received: AtomicU64,
}

impl LinkCounters {
    /// Take `(sent, sent_bytes, retry_bytes, received)` and zero them
    pub(crate) fn take(&self) -> (u64, u64, u64, u64) {
        (
            self.sent.swap(0, Ordering::Relaxed),
            self.sent_bytes.swap(0, Ordering::Relaxed),
            self.retry_bytes.swap(0, Ordering::Relaxed),
            self.received.swap(0, Ordering::Relaxed),
        )
    }
}

/// Sender-side retransmission state of a link
pub(crate) struct RetransmitState {
    pub queue: RetransmitQueue,
    /// Counters at the last statistics report
    pub reported: RetransmitCounters,
}

pub(crate) struct Link {
    id: PeerId,
    kind: LinkKind,
    pub(crate) config: PeerConfig,
    remote: SocketAddr,
    transport: Arc<dyn Transport>,
    pub(crate) peer: Mutex<Peer>,
    cipher: Option<Arc<dyn PacketCipher>>,
    pub(crate) counters: LinkCounters,
    pub(crate) retransmit: Mutex<RetransmitState>,
}

impl Link {
    pub(crate) fn new(
        id: PeerId,
        kind: LinkKind,
        config: PeerConfig,
        remote: SocketAddr,
        transport: Arc<dyn Transport>,
        stats_interval: Duration,
        now: Instant,
    ) -> Result<Self> {
        let cipher: Option<Arc<dyn PacketCipher>> = match config.effective_key_size() {
            Some(bits) => Some(Arc::new(AesGcmCipher::new(
                &config.secret,
                KeySize::from_bits(bits)?,
                config.key_rotation,
            )?)),
            None => None,
        };
        let congestion = CongestionController::new(&config, stats_interval);

        Ok(Link {
            id,
            kind,
            peer: Mutex::new(Peer::new(id, &config, now)),
            remote,
            transport,
            cipher,
            counters: LinkCounters::default(),
            retransmit: Mutex::new(RetransmitState {
                queue: RetransmitQueue::new(id, congestion),
                reported: RetransmitCounters::default(),
            }),
            config,
        })
    }

    pub(crate) fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn kind(&self) -> LinkKind {
        self.kind
    }

    pub(crate) fn is_client(&self) -> bool {
        matches!(self.kind, LinkKind::Client { .. })
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn state(&self) -> PeerState {
        self.peer.lock().state()
    }

    pub(crate) fn rtt(&self) -> Duration {
        self.peer.lock().rtt()
    }

    /// CNAME announced by the remote, or the configured one
    pub(crate) fn cname(&self) -> String {
        self.peer
            .lock()
            .remote_cname()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.cname.clone())
    }

    /// Send a data packet, sealing the payload if the link is encrypted
    pub(crate) fn send_data(&self, packet: &DataPacket) -> SendResult {
        let wire = match &self.cipher {
            Some(cipher) => {
                let seq = packet.seq.as_raw();
                let payload = match cipher.seal(packet.flow_id, seq, &packet.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        trace!(peer = %self.id, error = %e, "seal failed, packet not sent");
                        return Ok(());
                    }
                };
                let mut sealed = packet.clone();
                sealed.payload = payload;
                sealed.to_bytes()
            }
            None => packet.to_bytes(),
        };

        self.transport.send_to(&wire, self.remote)?;
        let len = packet.payload.len() as u64;
        if packet.retransmitted {
            self.counters.retry_bytes.fetch_add(len, Ordering::Relaxed);
        } else {
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            self.counters.sent_bytes.fetch_add(len, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Recover the plaintext of a received payload
    pub(crate) fn open_payload(&self, flow_id: u32, seq: u32, payload: Bytes) -> Option<Bytes> {
        match &self.cipher {
            Some(cipher) => match cipher.open(flow_id, seq, &payload) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    trace!(peer = %self.id, error = %e, "dropping undecryptable payload");
                    None
                }
            },
            None => Some(payload),
        }
    }

    pub(crate) fn send_control(&self, packet: &ControlPacket) -> SendResult {
        self.transport.send_to(&packet.to_bytes(), self.remote)?;
        Ok(())
    }
}

impl Member for Link {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    fn weight(&self) -> u32 {
        self.config.weight
    }

    fn is_live(&self) -> bool {
        self.peer.lock().is_live()
    }
}
