//! End-to-end tests
//!
//! A sender and a receiver context talk over an in-process network. The
//! network filter lets a test drop or count individual datagrams.

use bytes::Bytes;
use parking_lot::Mutex;
use rist::{
    AuthHandler, ConnectionEvent, Context, ContextBuilder, DataBlock, LogLevel, LoggingSettings,
    OobBlock, PeerConfig, PeerId, Profile, RistError, Role, StatsSnapshot,
};
use rist_io::{Datagram, MemoryNetwork};
use rist_protocol::{DataPacket, Packet};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PORT_A: u16 = 7000;
const PORT_B: u16 = 7001;
const BLOCK_SIZE: usize = 1000;

type Events = Arc<Mutex<Vec<(PeerId, ConnectionEvent)>>>;

fn builder(role: Role, profile: Profile, net: &MemoryNetwork) -> ContextBuilder {
    ContextBuilder::new(role)
        .profile(profile)
        .logging(LoggingSettings::new(LogLevel::Disable))
        .transport(Arc::new(net.clone()))
}

fn listener(port: u16) -> PeerConfig {
    let mut config = PeerConfig::new(format!("127.0.0.1:{port}"));
    config.initiate_conn = false;
    config
}

fn caller(port: u16) -> PeerConfig {
    PeerConfig::new(format!("127.0.0.1:{port}"))
}

fn record_events(ctx: &Context) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    ctx.set_connection_status_callback(move |peer, event| sink.lock().push((peer, event)))
        .unwrap();
    events
}

fn count(events: &Events, wanted: ConnectionEvent) -> usize {
    events.lock().iter().filter(|(_, e)| *e == wanted).count()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn block(index: u32) -> DataBlock {
    let mut payload = vec![(index % 251) as u8; BLOCK_SIZE];
    payload[..4].copy_from_slice(&index.to_be_bytes());
    DataBlock::new(payload)
}

fn index_of(block: &DataBlock) -> u32 {
    u32::from_be_bytes([
        block.payload[0],
        block.payload[1],
        block.payload[2],
        block.payload[3],
    ])
}

fn data_packet(datagram: &Datagram) -> Option<DataPacket> {
    match Packet::from_bytes(datagram.payload.clone()) {
        Ok(Packet::Data(packet)) => Some(packet),
        _ => None,
    }
}

fn read_blocks(receiver: &Context, n: usize, timeout: Duration) -> Vec<DataBlock> {
    let deadline = Instant::now() + timeout;
    let mut blocks = Vec::new();
    while blocks.len() < n && Instant::now() < deadline {
        if let Some(block) = receiver.read_data(Duration::from_millis(50)).unwrap() {
            blocks.push(block);
        }
    }
    blocks
}

/// Receiver listening on `receiver_peers`, sender calling `sender_peers`,
/// both started and every sender peer established
struct Session {
    sender: Context,
    receiver: Context,
    sender_events: Events,
    receiver_events: Events,
    sender_peers: Vec<PeerId>,
}

fn session(
    net: &MemoryNetwork,
    profile: Profile,
    sender_peers: &[PeerConfig],
    receiver_peers: &[PeerConfig],
) -> Session {
    let receiver = builder(Role::Receiver, profile, net).build().unwrap();
    let receiver_events = record_events(&receiver);
    for config in receiver_peers {
        receiver.peer_create(config).unwrap();
    }
    receiver.start().unwrap();

    let sender = builder(Role::Sender, profile, net).build().unwrap();
    let sender_events = record_events(&sender);
    let ids: Vec<PeerId> = sender_peers
        .iter()
        .map(|config| sender.peer_create(config).unwrap())
        .collect();
    sender.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            count(&sender_events, ConnectionEvent::Established) >= ids.len()
        }),
        "sender peers never established"
    );

    Session {
        sender,
        receiver,
        sender_events,
        receiver_events,
        sender_peers: ids,
    }
}

#[test]
fn test_lossless_delivery_in_order() {
    let net = MemoryNetwork::new();
    let s = session(&net, Profile::Main, &[caller(PORT_A)], &[listener(PORT_A)]);
    assert_eq!(count(&s.receiver_events, ConnectionEvent::ClientConnected), 1);

    for i in 0..200 {
        assert_eq!(s.sender.write_data(block(i)).unwrap(), BLOCK_SIZE);
    }

    let blocks = read_blocks(&s.receiver, 200, Duration::from_secs(5));
    assert_eq!(blocks.len(), 200);
    for (i, b) in blocks.iter().enumerate() {
        assert_eq!(index_of(b), i as u32);
        assert_eq!(b.len(), BLOCK_SIZE);
        assert!(!b.is_discontinuous());
        assert_eq!(b.flow_id, s.sender.flow_id().unwrap());
    }
    assert_eq!(s.receiver.queued(), 0);
}

#[test]
fn test_dropped_packets_are_recovered() {
    let net = MemoryNetwork::new();
    let s = session(&net, Profile::Main, &[caller(PORT_A)], &[listener(PORT_A)]);

    // Drop the first transmission of every tenth sequence number
    let dropped = Arc::new(Mutex::new(HashSet::new()));
    let base: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let drops = Arc::clone(&drops);
        let dropped = Arc::clone(&dropped);
        let base = Arc::clone(&base);
        net.set_filter(move |datagram| {
            let Some(packet) = data_packet(datagram) else {
                return true;
            };
            let seq = packet.seq.as_raw();
            let first = *base.lock().get_or_insert(seq);
            if packet.retransmitted || seq.wrapping_sub(first) % 10 != 5 {
                return true;
            }
            if dropped.lock().insert(seq) {
                drops.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            true
        });
    }

    let stats = Arc::new(Mutex::new(Vec::new()));
    {
        let stats = Arc::clone(&stats);
        s.receiver
            .set_stats_callback(Duration::from_millis(100), move |snapshot| {
                stats.lock().push(snapshot)
            })
            .unwrap();
    }

    for i in 0..100 {
        s.sender.write_data(block(i)).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let blocks = read_blocks(&s.receiver, 100, Duration::from_secs(5));
    assert_eq!(blocks.len(), 100);
    assert!(drops.load(Ordering::Relaxed) >= 9);
    let indices: Vec<u32> = blocks.iter().map(index_of).collect();
    assert_eq!(indices, (0..100).collect::<Vec<u32>>());
    assert!(blocks.iter().all(|b| !b.is_discontinuous()));

    assert!(wait_until(Duration::from_secs(2), || {
        let recovered: u64 = stats
            .lock()
            .iter()
            .map(|snapshot| match snapshot {
                StatsSnapshot::ReceiverFlow(flow) => flow.recovered,
                StatsSnapshot::SenderPeer(_) => 0,
            })
            .sum();
        recovered as usize >= drops.load(Ordering::Relaxed)
    }));
}

#[test]
fn test_unrecoverable_loss_marks_discontinuity() {
    let net = MemoryNetwork::new();
    let mut small_buffer = listener(PORT_A);
    small_buffer.recovery_length_min = 200;
    small_buffer.recovery_length_max = 200;
    let s = session(&net, Profile::Main, &[caller(PORT_A)], &[small_buffer]);

    // Sequence base + 5 never makes it, retransmissions included
    let base: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    {
        let base = Arc::clone(&base);
        net.set_filter(move |datagram| {
            let Some(packet) = data_packet(datagram) else {
                return true;
            };
            let seq = packet.seq.as_raw();
            let first = *base.lock().get_or_insert(seq);
            seq.wrapping_sub(first) != 5
        });
    }

    let lost = Arc::new(Mutex::new(0u64));
    {
        let lost = Arc::clone(&lost);
        s.receiver
            .set_stats_callback(Duration::from_millis(100), move |snapshot| {
                if let StatsSnapshot::ReceiverFlow(flow) = snapshot {
                    *lost.lock() += flow.lost;
                }
            })
            .unwrap();
    }

    for i in 0..30 {
        s.sender.write_data(block(i)).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let blocks = read_blocks(&s.receiver, 29, Duration::from_secs(5));
    assert_eq!(blocks.len(), 29);
    let indices: Vec<u32> = blocks.iter().map(index_of).collect();
    let expected: Vec<u32> = (0..30).filter(|i| *i != 5).collect();
    assert_eq!(indices, expected);

    let discontinuous: Vec<u32> = blocks
        .iter()
        .filter(|b| b.is_discontinuous())
        .map(index_of)
        .collect();
    assert_eq!(discontinuous, vec![6]);

    assert!(wait_until(Duration::from_secs(2), || *lost.lock() == 1));
}

/// Original transmissions per destination port
fn count_paths(net: &MemoryNetwork) -> Arc<Mutex<HashMap<u16, usize>>> {
    let paths = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&paths);
    net.set_filter(move |datagram| {
        if let Some(packet) = data_packet(datagram) {
            if !packet.retransmitted {
                *sink.lock().entry(datagram.to.port()).or_insert(0) += 1;
            }
        }
        true
    });
    paths
}

#[test]
fn test_zero_weights_duplicate_to_every_peer() {
    let net = MemoryNetwork::new();
    let s = session(
        &net,
        Profile::Main,
        &[caller(PORT_A), caller(PORT_B)],
        &[listener(PORT_A), listener(PORT_B)],
    );
    let paths = count_paths(&net);

    for i in 0..50 {
        s.sender.write_data(block(i)).unwrap();
    }

    let blocks = read_blocks(&s.receiver, 50, Duration::from_secs(5));
    let indices: Vec<u32> = blocks.iter().map(index_of).collect();
    assert_eq!(indices, (0..50).collect::<Vec<u32>>());

    assert!(wait_until(Duration::from_secs(2), || {
        let paths = paths.lock();
        paths.get(&PORT_A) == Some(&50) && paths.get(&PORT_B) == Some(&50)
    }));
    // Nothing extra reaches the application
    thread::sleep(Duration::from_millis(200));
    assert_eq!(s.receiver.queued(), 0);
}

#[test]
fn test_weights_split_traffic() {
    let net = MemoryNetwork::new();
    let mut light = caller(PORT_A);
    light.weight = 1;
    let mut heavy = caller(PORT_B);
    heavy.weight = 3;
    let s = session(
        &net,
        Profile::Main,
        &[light, heavy],
        &[listener(PORT_A), listener(PORT_B)],
    );
    let paths = count_paths(&net);

    for i in 0..400 {
        s.sender.write_data(block(i)).unwrap();
    }

    let blocks = read_blocks(&s.receiver, 400, Duration::from_secs(5));
    assert_eq!(blocks.len(), 400);

    let paths = paths.lock();
    let a = paths.get(&PORT_A).copied().unwrap_or(0);
    let b = paths.get(&PORT_B).copied().unwrap_or(0);
    assert_eq!(a + b, 400);
    assert!((98..=102).contains(&a), "light path carried {a}");
}

#[test]
fn test_silent_peer_times_out_once() {
    let net = MemoryNetwork::new();
    let mut config = caller(PORT_A);
    config.session_timeout = 300;
    config.keepalive_interval = 100;
    let s = session(&net, Profile::Main, &[config], &[listener(PORT_A)]);
    assert_eq!(count(&s.sender_events, ConnectionEvent::TimedOut), 0);

    net.set_filter(|_| false);

    assert!(wait_until(Duration::from_secs(2), || {
        count(&s.sender_events, ConnectionEvent::TimedOut) == 1
    }));
    thread::sleep(Duration::from_millis(800));
    assert_eq!(count(&s.sender_events, ConnectionEvent::TimedOut), 1);
    assert_eq!(
        s.sender_events.lock().last().map(|(peer, _)| *peer),
        Some(s.sender_peers[0])
    );
}

#[test]
fn test_operations_fail_after_destroy() {
    let net = MemoryNetwork::new();
    let s = session(&net, Profile::Main, &[caller(PORT_A)], &[listener(PORT_A)]);

    s.sender.destroy().unwrap();
    s.receiver.destroy().unwrap();

    assert!(matches!(
        s.sender.write_data(block(0)),
        Err(RistError::Destroyed)
    ));
    assert!(matches!(
        s.receiver.read_data(Duration::ZERO),
        Err(RistError::Destroyed)
    ));
    assert!(matches!(s.sender.flow_id(), Err(RistError::Destroyed)));
    assert!(matches!(
        s.sender.peer_create(&caller(PORT_B)),
        Err(RistError::Destroyed)
    ));
    assert_eq!(net.endpoint_count(), 0);
}

#[test]
fn test_oob_both_directions() {
    let net = MemoryNetwork::new();
    let s = session(&net, Profile::Main, &[caller(PORT_A)], &[listener(PORT_A)]);

    let inbox = Arc::new(Mutex::new(Vec::new()));
    {
        let inbox = Arc::clone(&inbox);
        s.receiver
            .set_oob_callback(move |block| inbox.lock().push(block))
            .unwrap();
    }

    let peer = s.sender_peers[0];
    s.sender
        .oob_write(OobBlock::new(peer, Bytes::from_static(b"hello")))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || !inbox.lock().is_empty()));
    let client = {
        let inbox = inbox.lock();
        assert_eq!(&inbox[0].payload[..], b"hello");
        inbox[0].peer
    };

    s.receiver
        .oob_write(OobBlock::new(client, Bytes::from_static(b"ack")))
        .unwrap();
    let mut reply = None;
    assert!(wait_until(Duration::from_secs(2), || {
        reply = s.sender.oob_read().unwrap();
        reply.is_some()
    }));
    assert_eq!(reply.map(|b| b.payload), Some(Bytes::from_static(b"ack")));
}

#[test]
fn test_oob_needs_main_profile() {
    let net = MemoryNetwork::new();
    let ctx = builder(Role::Sender, Profile::Simple, &net).build().unwrap();
    let peer = ctx.peer_create(&caller(PORT_A)).unwrap();
    let err = ctx
        .oob_write(OobBlock::new(peer, Bytes::from_static(b"x")))
        .unwrap_err();
    assert_eq!(err.code(), -4);
}

#[test]
fn test_auth_handler_refuses_client() {
    let net = MemoryNetwork::new();
    let receiver = builder(Role::Receiver, Profile::Main, &net)
        .build()
        .unwrap();
    let receiver_events = record_events(&receiver);
    let listen = receiver.peer_create(&listener(PORT_A)).unwrap();

    let asked = Arc::new(Mutex::new(Vec::new()));
    {
        let asked = Arc::clone(&asked);
        receiver
            .set_auth_handler(AuthHandler::new(
                move |request| {
                    asked.lock().push(request.clone());
                    false
                },
                |_| {},
            ))
            .unwrap();
    }
    receiver.start().unwrap();

    let sender = builder(Role::Sender, Profile::Main, &net).build().unwrap();
    let sender_events = record_events(&sender);
    sender.peer_create(&caller(PORT_A)).unwrap();
    sender.start().unwrap();
    for i in 0..10 {
        sender.write_data(block(i)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || !asked.lock().is_empty()));
    thread::sleep(Duration::from_millis(300));

    {
        let asked = asked.lock();
        assert_eq!(asked[0].listener, listen);
        assert_eq!(asked[0].local.port(), PORT_A);
    }
    assert_eq!(count(&receiver_events, ConnectionEvent::ClientConnected), 0);
    assert_eq!(count(&sender_events, ConnectionEvent::Established), 0);
    assert!(receiver.read_data(Duration::ZERO).unwrap().is_none());
}

#[test]
fn test_data_callback_delivery() {
    let net = MemoryNetwork::new();
    let receiver = builder(Role::Receiver, Profile::Simple, &net)
        .build()
        .unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    {
        let delivered = Arc::clone(&delivered);
        receiver.set_output_fifo_size(0).unwrap();
        receiver
            .set_data_callback(move |block| delivered.lock().push(index_of(&block)))
            .unwrap();
    }
    receiver.peer_create(&listener(PORT_A)).unwrap();
    receiver.start().unwrap();

    let sender = builder(Role::Sender, Profile::Simple, &net).build().unwrap();
    sender.peer_create(&caller(PORT_A)).unwrap();
    sender.start().unwrap();
    for i in 0..20 {
        sender.write_data(block(i)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || delivered.lock().len() == 20));
    assert_eq!(*delivered.lock(), (0..20).collect::<Vec<u32>>());
}

#[test]
fn test_error_codes() {
    let net = MemoryNetwork::new();

    let err = builder(Role::Receiver, Profile::Advanced, &net)
        .build()
        .unwrap_err();
    assert_eq!(err.code(), -4);

    let ctx = builder(Role::Receiver, Profile::Main, &net).build().unwrap();
    assert_eq!(ctx.peer_destroy(PeerId::new(42)).unwrap_err().code(), -2);

    let mut long_name = listener(PORT_A);
    long_name.cname = "c".repeat(128);
    assert_eq!(ctx.peer_create(&long_name).unwrap_err().code(), -3);

    let mut half_credentials = listener(PORT_A);
    half_credentials.srp_password = "secret".to_string();
    assert_eq!(ctx.peer_create(&half_credentials).unwrap_err().code(), -6);

    ctx.set_output_fifo_size(0).unwrap();
    assert_eq!(ctx.start().unwrap_err().code(), -5);
}
