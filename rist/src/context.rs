//! Sender and receiver contexts
//!
//! A [`Context`] owns its peers, its flow id, its delivery queues and its
//! worker threads:
//!
//! - one receive thread per bound transport (see [`crate::endpoint`])
//! - one worker per received flow (receivers, see [`crate::receiver`])
//! - one send thread fed by a bounded queue (senders, see [`crate::sender`])
//! - one timer thread for keepalives, timeouts, retransmission draining,
//!   cache eviction and statistics
//!
//! [`Context::destroy`] signals every thread, joins them, then frees the
//! peers and queues. Every later operation fails with
//! [`RistError::Destroyed`].

use crate::endpoint::{self, Endpoint};
use crate::error::{Result, RistError};
use crate::events::{
    AuthHandler, ConnectionCallback, ConnectionEvent, DataCallback, OobCallback, StatsCallback,
};
use crate::flow_id;
use crate::link::{Link, LinkKind};
use crate::logging::LoggingSettings;
use crate::output::{DeliveryQueue, DEFAULT_FIFO_SIZE};
use crate::receiver::ReceiverState;
use crate::sender::SenderState;
use crate::stats;
use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rist_bonding::PeerGroup;
use rist_io::{ntp_now, BindOptions, Clock, Timer, TransportFactory, UdpFactory};
use rist_protocol::{
    AddressFamily, ControlPacket, DataBlock, NackMode, OobBlock, PeerConfig, PeerId, PeerState,
    Profile, MAX_PAYLOAD_SIZE,
};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, Span};

/// Timer thread period
pub(crate) const TIMER_TICK: Duration = Duration::from_millis(10);

/// Congestion budget interval when no statistics interval is registered
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1000);

const MAX_PEERS: usize = 64;

const OOB_FIFO_SIZE: usize = 1024;

/// Which side of a flow a context is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Configuring,
    Running,
    Destroyed,
}

/// State shared by the handle and the worker threads
pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) profile: Profile,
    pub(crate) span: Span,
    lifecycle: Mutex<Lifecycle>,
    destroyed: AtomicBool,
    flow_id: AtomicU32,
    pub(crate) clock: Clock,
    factory: Arc<dyn TransportFactory>,
    pub(crate) group: PeerGroup<Link>,
    next_peer: AtomicU32,
    pub(crate) endpoints: Mutex<BTreeMap<PeerId, Arc<Endpoint>>>,
    pub(crate) output: DeliveryQueue<DataBlock>,
    pub(crate) oob: DeliveryQueue<OobBlock>,
    connection_cb: RwLock<Option<ConnectionCallback>>,
    auth: RwLock<Option<AuthHandler>>,
    stats_cb: RwLock<Option<(Duration, StatsCallback)>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    pub(crate) shutdown_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) sender: Option<SenderState>,
    pub(crate) receiver: Option<ReceiverState>,
}

impl Shared {
    pub(crate) fn flow_id(&self) -> u32 {
        self.flow_id.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn next_peer_id(&self) -> PeerId {
        PeerId::new(self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn stats_interval(&self) -> Duration {
        self.stats_cb
            .read()
            .as_ref()
            .map(|(interval, _)| *interval)
            .unwrap_or(DEFAULT_STATS_INTERVAL)
    }

    pub(crate) fn auth_handler(&self) -> Option<AuthHandler> {
        self.auth.read().clone()
    }

    /// Raise a connection event
    pub(crate) fn emit(&self, peer: PeerId, event: ConnectionEvent) {
        let callback = self.connection_cb.read().clone();
        if let Some(callback) = callback {
            callback(peer, event);
        }
    }

    /// Run `f` on a named thread inside the context span
    pub(crate) fn spawn<F>(self: &Arc<Self>, name: String, f: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(Arc<Shared>) + Send + 'static,
    {
        let shared = Arc::clone(self);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let span = shared.span.clone();
                let _entered = span.enter();
                f(shared)
            })
            .map_err(|e| RistError::Malloc(e.to_string()))
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Forget a client link: drop it from the group and its listener
    pub(crate) fn remove_client(&self, link: &Link) {
        if let LinkKind::Client { listener } = link.kind() {
            if let Some(endpoint) = self.endpoints.lock().get(&listener) {
                endpoint.clients.lock().remove(&link.remote());
            }
        }
        let _ = self.group.remove(link.id());
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    role: Role,
    profile: Profile,
    flow_id: u32,
    logging: LoggingSettings,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl ContextBuilder {
    pub fn new(role: Role) -> Self {
        ContextBuilder {
            role,
            profile: Profile::default(),
            flow_id: 0,
            logging: LoggingSettings::default(),
            factory: None,
        }
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Flow id for a sender; 0 picks a random one
    pub fn flow_id(mut self, flow_id: u32) -> Self {
        self.flow_id = flow_id;
        self
    }

    pub fn logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = logging;
        self
    }

    /// Transport used to bind peers (UDP by default)
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Context> {
        if self.profile == Profile::Advanced {
            return Err(RistError::InvalidProfile("advanced profile is not supported"));
        }

        let flow_id = match self.role {
            Role::Sender => flow_id::register(self.flow_id)?,
            Role::Receiver => self.flow_id,
        };

        let span = if self.logging.level.as_tracing_level().is_some() {
            info_span!("rist", role = %self.role, flow_id)
        } else {
            Span::none()
        };

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let shared = Shared {
            role: self.role,
            profile: self.profile,
            span,
            lifecycle: Mutex::new(Lifecycle::Configuring),
            destroyed: AtomicBool::new(false),
            flow_id: AtomicU32::new(flow_id),
            clock: Clock::new(),
            factory: self.factory.unwrap_or_else(|| Arc::new(UdpFactory)),
            group: PeerGroup::new(MAX_PEERS),
            next_peer: AtomicU32::new(1),
            endpoints: Mutex::new(BTreeMap::new()),
            output: DeliveryQueue::new("data", DEFAULT_FIFO_SIZE),
            oob: DeliveryQueue::new("oob", OOB_FIFO_SIZE),
            connection_cb: RwLock::new(None),
            auth: RwLock::new(None),
            stats_cb: RwLock::new(None),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
            sender: (self.role == Role::Sender).then(SenderState::new),
            receiver: (self.role == Role::Receiver).then(ReceiverState::new),
        };

        {
            let _entered = shared.span.enter();
            info!(profile = shared.profile.as_str(), "context created");
        }

        Ok(Context {
            shared: Arc::new(shared),
        })
    }
}

/// A RIST sender or receiver
///
/// Dropping the context destroys it.
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    /// Create a context using UDP transport
    ///
    /// `flow_id` 0 lets a sender pick a random id.
    pub fn create(
        role: Role,
        profile: Profile,
        flow_id: u32,
        logging: LoggingSettings,
    ) -> Result<Self> {
        ContextBuilder::new(role)
            .profile(profile)
            .flow_id(flow_id)
            .logging(logging)
            .build()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn profile(&self) -> Profile {
        self.shared.profile
    }

    pub fn is_running(&self) -> bool {
        *self.shared.lifecycle.lock() == Lifecycle::Running
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_stopping()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.shared.is_stopping() {
            return Err(RistError::Destroyed);
        }
        Ok(())
    }

    fn ensure_role(&self, role: Role) -> Result<()> {
        self.ensure_alive()?;
        if self.shared.role != role {
            return Err(RistError::WrongRole(self.shared.role));
        }
        Ok(())
    }

    pub fn flow_id(&self) -> Result<u32> {
        self.ensure_alive()?;
        Ok(self.shared.flow_id())
    }

    /// Change the flow id; only before [`Context::start`]
    pub fn set_flow_id(&self, flow_id: u32) -> Result<()> {
        self.ensure_alive()?;
        if self.is_running() {
            return Err(RistError::AlreadyRunning);
        }
        if self.shared.role == Role::Sender {
            flow_id::replace(self.shared.flow_id(), flow_id)?;
        }
        self.shared.flow_id.store(flow_id, Ordering::Release);
        Ok(())
    }

    /// Add a peer
    ///
    /// An initiating peer sends towards its address; a listening peer
    /// binds it and accepts clients.
    pub fn peer_create(&self, config: &PeerConfig) -> Result<PeerId> {
        self.ensure_alive()?;
        config.validate()?;

        let remote = resolve_address(config)?;
        let options = BindOptions {
            miface: Some(config.miface.clone()).filter(|m| !m.is_empty()),
            ..Default::default()
        };
        let id = self.shared.next_peer_id();
        let now = Instant::now();

        let (endpoint, link) = if config.initiate_conn {
            let local = SocketAddr::new(unspecified(remote.ip()), config.physical_port);
            let transport = self.shared.factory.bind(local, &options)?;
            let link = Link::new(
                id,
                LinkKind::Initiator,
                config.clone(),
                remote,
                Arc::clone(&transport),
                self.shared.stats_interval(),
                now,
            )?;
            let endpoint = Endpoint::new(id, config.clone(), transport, false);
            (endpoint, Some(Arc::new(link)))
        } else {
            let transport = self.shared.factory.bind(remote, &options)?;
            (Endpoint::new(id, config.clone(), transport, true), None)
        };
        let endpoint = Arc::new(endpoint);

        {
            // destroy() takes the endpoints after raising the flag
            let mut endpoints = self.shared.endpoints.lock();
            if self.shared.is_stopping() {
                return Err(RistError::Destroyed);
            }
            if let Some(link) = link {
                self.shared.group.add(link)?;
            }
            endpoints.insert(id, Arc::clone(&endpoint));
        }

        if let Some(sender) = &self.shared.sender {
            sender.configure(config);
        }

        if self.is_running() {
            endpoint::start(&self.shared, &endpoint)?;
        }

        info!(
            peer = %id,
            address = %remote,
            listening = !config.initiate_conn,
            "peer created"
        );
        Ok(id)
    }

    /// Remove a peer; a listening peer takes its clients with it
    pub fn peer_destroy(&self, peer: PeerId) -> Result<()> {
        self.ensure_alive()?;
        let shutdown = ControlPacket::shutdown(self.shared.flow_id(), ntp_now());

        let endpoint = self.shared.endpoints.lock().remove(&peer);
        if let Some(endpoint) = endpoint {
            endpoint.close();
            let clients: Vec<PeerId> = endpoint.clients.lock().drain().map(|(_, id)| id).collect();
            for id in clients.into_iter().chain(std::iter::once(peer)) {
                if let Ok(link) = self.shared.group.remove(id) {
                    let _ = link.send_control(&shutdown);
                }
            }
            endpoint.join();
            info!(%peer, "peer destroyed");
            return Ok(());
        }

        let link = self.shared.group.get(peer).ok_or(RistError::NullPeer)?;
        let _ = link.send_control(&shutdown);
        self.shared.remove_client(&link);
        info!(%peer, "client destroyed");
        Ok(())
    }

    /// Configured peers and connected clients
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.shared.endpoints.lock().keys().copied().collect();
        for link in self.shared.group.members() {
            if !ids.contains(&link.id()) {
                ids.push(link.id());
            }
        }
        ids.sort();
        ids
    }

    /// Connection state of a peer carrying traffic
    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.shared.group.get(peer).map(|link| link.state())
    }

    /// Start the worker threads
    pub fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut lifecycle = self.shared.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Configuring => {}
            Lifecycle::Running => return Err(RistError::AlreadyRunning),
            Lifecycle::Destroyed => return Err(RistError::Destroyed),
        }

        if self.shared.role == Role::Receiver
            && self.shared.output.capacity() == 0
            && !self.shared.output.has_callback()
        {
            return Err(RistError::MissingCallback(
                "output FIFO disabled and no data callback registered",
            ));
        }

        let endpoints: Vec<Arc<Endpoint>> =
            self.shared.endpoints.lock().values().cloned().collect();
        for endpoint in &endpoints {
            endpoint::start(&self.shared, endpoint)?;
        }

        let timer = self
            .shared
            .spawn(format!("rist-timer-{}", self.shared.role), run_timer)?;
        self.shared.track(timer);

        if self.shared.sender.is_some() {
            let send = self.shared.spawn("rist-send".to_string(), |shared| {
                if let Some(sender) = &shared.sender {
                    sender.run(&shared);
                }
            })?;
            self.shared.track(send);
        }

        *lifecycle = Lifecycle::Running;
        info!("context started");
        Ok(())
    }

    /// Stop every thread and free all peers, queues and caches
    ///
    /// Calling it again is a no-op.
    pub fn destroy(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *shared.lifecycle.lock() = Lifecycle::Destroyed;
        let _entered = shared.span.enter();

        let shutdown = ControlPacket::shutdown(shared.flow_id(), ntp_now());
        for link in shared.group.members() {
            if link.state() != PeerState::Disconnected {
                let _ = link.send_control(&shutdown);
            }
        }

        shared.shutdown_tx.lock().take();
        let endpoints: Vec<Arc<Endpoint>> =
            std::mem::take(&mut *shared.endpoints.lock()).into_values().collect();
        for endpoint in &endpoints {
            endpoint.close();
        }
        shared.output.close();
        shared.oob.close();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *shared.workers.lock());
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        for endpoint in &endpoints {
            endpoint.join();
        }
        if let Some(receiver) = &shared.receiver {
            receiver.shutdown();
        }
        if let Some(sender) = &shared.sender {
            sender.clear();
            flow_id::release(shared.flow_id());
        }
        shared.group.drain();

        info!("context destroyed");
        Ok(())
    }

    /// Queue a block for sending; returns the payload length
    pub fn write_data(&self, block: DataBlock) -> Result<usize> {
        self.ensure_role(Role::Sender)?;
        if !self.is_running() {
            return Err(RistError::NotRunning);
        }
        if self.shared.endpoints.lock().is_empty() {
            return Err(RistError::NullPeer);
        }
        if block.is_empty() {
            return Err(RistError::InvalidBlock("empty payload".to_string()));
        }
        if block.len() > MAX_PAYLOAD_SIZE {
            return Err(RistError::InvalidBlock(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                block.len()
            )));
        }

        match &self.shared.sender {
            Some(sender) => sender.submit(&self.shared, block),
            None => Err(RistError::WrongRole(self.shared.role)),
        }
    }

    /// Oldest delivered block, waiting up to `timeout`
    pub fn read_data(&self, timeout: Duration) -> Result<Option<DataBlock>> {
        self.ensure_role(Role::Receiver)?;
        self.shared.output.pop(timeout)
    }

    /// Deliver blocks through a callback instead of the FIFO
    pub fn set_data_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(DataBlock) + Send + Sync + 'static,
    {
        self.ensure_role(Role::Receiver)?;
        let callback: DataCallback = Arc::new(callback);
        self.shared.output.set_callback(callback);
        Ok(())
    }

    /// Blocks currently queued in the output FIFO
    pub fn queued(&self) -> usize {
        self.shared.output.len()
    }

    /// Output FIFO size; rounded up to a power of two, 0 disables it
    pub fn set_output_fifo_size(&self, size: usize) -> Result<()> {
        self.ensure_role(Role::Receiver)?;
        self.shared.output.set_capacity(size);
        Ok(())
    }

    /// Write one byte to `writer` whenever the output FIFO becomes non-empty
    pub fn set_notify<W>(&self, writer: W) -> Result<()>
    where
        W: Write + Send + 'static,
    {
        self.ensure_role(Role::Receiver)?;
        self.shared.output.set_notify(Box::new(writer));
        Ok(())
    }

    /// NACK encoding used by this receiver
    pub fn set_nack_type(&self, mode: NackMode) -> Result<()> {
        self.ensure_role(Role::Receiver)?;
        if let Some(receiver) = &self.shared.receiver {
            receiver.set_nack_mode(mode);
        }
        Ok(())
    }

    /// Send an out-of-band block to its peer
    pub fn oob_write(&self, block: OobBlock) -> Result<usize> {
        self.ensure_alive()?;
        self.ensure_oob()?;
        let link = self.shared.group.get(block.peer).ok_or(RistError::NullPeer)?;
        let len = block.len();
        let ts = if block.ts_ntp == 0 { ntp_now() } else { block.ts_ntp };
        link.send_control(&ControlPacket::oob(self.shared.flow_id(), ts, block.payload))?;
        Ok(len)
    }

    /// Oldest received out-of-band block, if any
    pub fn oob_read(&self) -> Result<Option<OobBlock>> {
        self.ensure_alive()?;
        self.ensure_oob()?;
        self.shared.oob.pop(Duration::ZERO)
    }

    pub fn set_oob_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(OobBlock) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        self.ensure_oob()?;
        let callback: OobCallback = Arc::new(callback);
        self.shared.oob.set_callback(callback);
        Ok(())
    }

    fn ensure_oob(&self) -> Result<()> {
        if self.shared.profile == Profile::Simple {
            return Err(RistError::InvalidProfile(
                "out-of-band data needs the main profile",
            ));
        }
        Ok(())
    }

    pub fn set_connection_status_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(PeerId, ConnectionEvent) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        let callback: ConnectionCallback = Arc::new(callback);
        *self.shared.connection_cb.write() = Some(callback);
        Ok(())
    }

    /// Admission hook for clients of listening peers
    pub fn set_auth_handler(&self, handler: AuthHandler) -> Result<()> {
        self.ensure_alive()?;
        *self.shared.auth.write() = Some(handler);
        Ok(())
    }

    /// Receive a statistics snapshot every `interval`
    pub fn set_stats_callback<F>(&self, interval: Duration, callback: F) -> Result<()>
    where
        F: Fn(rist_protocol::StatsSnapshot) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        if interval.is_zero() {
            return Err(RistError::InvalidBlock(
                "statistics interval must be positive".to_string(),
            ));
        }
        let callback: StatsCallback = Arc::new(callback);
        *self.shared.stats_cb.write() = Some((interval, callback));
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("role", &self.shared.role)
            .field("profile", &self.shared.profile)
            .field("flow_id", &self.shared.flow_id())
            .field("peers", &self.shared.group.len())
            .finish()
    }
}

fn unspecified(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}

/// Resolve `host:port`; a bare `:port` means the wildcard address
fn resolve_address(config: &PeerConfig) -> Result<SocketAddr> {
    let address = config.address.trim();
    let address = if address.starts_with(':') {
        match config.address_family {
            AddressFamily::Inet => format!("0.0.0.0{address}"),
            AddressFamily::Inet6 => format!("[::]{address}"),
        }
    } else {
        address.to_string()
    };

    let resolved: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|e| RistError::InvalidAddress(format!("{address}: {e}")))?
        .collect();
    let wanted_v6 = config.address_family == AddressFamily::Inet6;
    resolved
        .iter()
        .find(|a| a.is_ipv6() == wanted_v6)
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| RistError::InvalidAddress(address.clone()))
}

/// Timer thread: liveness, keepalives, retransmissions, statistics
fn run_timer(shared: Arc<Shared>) {
    let ticker = tick(TIMER_TICK);
    let start = Instant::now();
    let mut congestion_timer = Timer::new(shared.stats_interval(), start);
    let mut stats_timer = Timer::new(shared.stats_interval(), start);

    loop {
        select! {
            recv(ticker) -> _ => {
                let now = Instant::now();
                on_tick(&shared, now);

                let interval = shared.stats_interval();
                congestion_timer.set_interval(interval);
                if let Some(elapsed) = congestion_timer.try_fire(now) {
                    for link in shared.group.members() {
                        link.retransmit.lock().queue.on_interval(elapsed);
                    }
                }

                let callback = shared.stats_cb.read().as_ref().map(|(_, cb)| Arc::clone(cb));
                stats_timer.set_interval(interval);
                if let Some(elapsed) = stats_timer.try_fire(now) {
                    if let Some(callback) = callback {
                        for snapshot in stats::collect(&shared, elapsed) {
                            callback(snapshot);
                        }
                    }
                }
            }
            recv(shared.shutdown_rx) -> _ => break,
        }
    }
    debug!("timer thread stopped");
}

fn on_tick(shared: &Arc<Shared>, now: Instant) {
    let flow_id = shared.flow_id();

    for link in shared.group.members() {
        let (timed_out, keepalive) = {
            let mut peer = link.peer.lock();
            (peer.poll_timeout(now), peer.keepalive_due(now))
        };

        if timed_out {
            let event = if link.is_client() {
                ConnectionEvent::ClientTimedOut
            } else {
                ConnectionEvent::TimedOut
            };
            info!(peer = %link.id(), remote = %link.remote(), "peer timed out");
            shared.emit(link.id(), event);
            if link.is_client() {
                shared.remove_client(&link);
                if let Some(auth) = shared.auth_handler() {
                    (auth.disconnect)(link.id());
                }
                continue;
            }
        }

        if keepalive {
            let ts = ntp_now();
            let _ = link.send_control(&ControlPacket::keepalive(flow_id, ts, &link.config.cname));
            let echo = ControlPacket::echo_request(flow_id, ts, shared.clock.micros_at(now));
            let _ = link.send_control(&echo);
        }

        if let Some(sender) = &shared.sender {
            sender.drain(&link, TIMER_TICK, now);
        }
    }

    if let Some(sender) = &shared.sender {
        sender.evict(now);
    }
    if let Some(receiver) = &shared.receiver {
        receiver.reap(shared, now);
    }
}
