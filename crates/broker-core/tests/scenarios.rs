//! End-to-end scenarios driven over real loopback TCP sockets: one `Broker` per test
//! (sometimes two, for federation) ticking on a background thread, exercised with plain
//! `std::net::TcpStream` clients speaking the wire protocol directly.

use broker_core::net::frame::{self, opcode, Command};
use broker_core::{Broker, Config};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Binds a broker to an ephemeral port and ticks it on a background thread until the
/// returned handle is stopped and joined.
struct Harness {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Harness {
    fn spawn(config: Config) -> Harness {
        let mut broker = Broker::bind(&config, broker_support::logging::discard()).expect("bind");
        // The broker always binds `0.0.0.0`; rewrite to the loopback address explicitly
        // so both this test's clients and any peer broker connect somewhere concrete
        // rather than relying on platform-specific "connect to 0.0.0.0" behavior.
        let mut addr = broker.local_addr().expect("local_addr");
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
        let stop = Arc::new(AtomicBool::new(false));
        let stop_loop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_loop.load(Ordering::Relaxed) {
                broker.tick(Instant::now());
                thread::sleep(Duration::from_millis(2));
            }
        });
        Harness { addr, stop, handle: Some(handle) }
    }

    fn connect(&self) -> TcpStream {
        connect(self.addr)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(Duration::from_millis(150))).unwrap();
    stream
}

fn ephemeral_config() -> Config {
    Config { port: 0, ..Config::default() }
}

// --- wire-building helpers -------------------------------------------------

fn clear(buf: &mut Vec<u8>) {
    frame::write_nullary(buf, opcode::CLEAR).unwrap();
}

fn nullary(buf: &mut Vec<u8>, op: u8) {
    frame::write_nullary(buf, op).unwrap();
}

fn int(buf: &mut Vec<u8>, op: u8, value: u64) {
    frame::write_int(buf, op, value).unwrap();
}

fn bytes(buf: &mut Vec<u8>, op: u8, data: &[u8]) {
    frame::write_bytes(buf, op, data).unwrap();
}

fn consume_frame(queue_name: &str, max: u64, priority: u64, exclusive: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    clear(&mut buf);
    bytes(&mut buf, opcode::QUEUE, queue_name.as_bytes());
    int(&mut buf, opcode::MAX, max);
    int(&mut buf, opcode::PRIORITY, priority);
    if exclusive {
        nullary(&mut buf, opcode::EXCLUSIVE);
    }
    nullary(&mut buf, opcode::CONSUME);
    buf
}

fn request_frame(queue_name: &str, id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    clear(&mut buf);
    int(&mut buf, opcode::ID, id);
    bytes(&mut buf, opcode::QUEUE, queue_name.as_bytes());
    bytes(&mut buf, opcode::PAYLOAD, payload);
    nullary(&mut buf, opcode::REQUEST);
    buf
}

fn broadcast_frame(queue_name: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    clear(&mut buf);
    bytes(&mut buf, opcode::QUEUE, queue_name.as_bytes());
    bytes(&mut buf, opcode::PAYLOAD, payload);
    nullary(&mut buf, opcode::BROADCAST);
    buf
}

fn reply_frame(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    clear(&mut buf);
    int(&mut buf, opcode::ID, id);
    bytes(&mut buf, opcode::PAYLOAD, payload);
    nullary(&mut buf, opcode::REPLY);
    buf
}

// --- reading decoded commands back off a socket ----------------------------

struct Reader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Reader {
    fn new(stream: TcpStream) -> Reader {
        Reader { stream, buf: Vec::new() }
    }

    /// Reads and decodes commands until at least one full command has been seen or the
    /// deadline passes, whichever comes first. Returns whatever was decoded (possibly
    /// empty, if nothing arrived in time).
    fn next_commands(&mut self, deadline: Instant) -> Vec<Command> {
        loop {
            let mut commands = Vec::new();
            let used = frame::decode(&self.buf, |c| commands.push(c)).expect("decode");
            self.buf.drain(0..used);
            if !commands.is_empty() {
                return commands;
            }
            if Instant::now() >= deadline {
                return commands;
            }
            let mut tmp = [0u8; 4096];
            match self.stream.read(&mut tmp) {
                Ok(0) => return commands,
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(_) => return commands,
            }
        }
    }

    fn expect_nullary(&mut self, op: u8, within: Duration) -> Vec<Command> {
        let commands = self.next_commands(Instant::now() + within);
        assert!(
            commands.iter().any(|c| matches!(c, Command::Nullary(o) if *o == op)),
            "expected opcode {} among {:?}",
            op,
            commands
        );
        commands
    }

    fn has_no_commands(&mut self, within: Duration) -> bool {
        self.next_commands(Instant::now() + within).is_empty()
    }
}

fn find_int(commands: &[Command], op: u8) -> Option<u64> {
    commands.iter().find_map(|c| match c {
        Command::Int(o, v) if *o == op => Some(*v),
        _ => None,
    })
}

fn find_bytes<'a>(commands: &'a [Command], op: u8) -> Option<&'a [u8]> {
    commands.iter().find_map(|c| match c {
        Command::Bytes(o, v) if *o == op => Some(v.as_slice()),
        _ => None,
    })
}

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn simple_request_reply() {
    let harness = Harness::spawn(ephemeral_config());

    let mut consumer = harness.connect();
    let mut consumer_reader = Reader::new(consumer.try_clone().unwrap());
    consumer.write_all(&consume_frame("work", 0, 2, false)).unwrap();
    let acked = consumer_reader.expect_nullary(opcode::CONSUMING, WAIT);
    assert_eq!(find_bytes(&acked, opcode::QUEUE), Some(&b"work"[..]));

    let mut producer = harness.connect();
    let mut producer_reader = Reader::new(producer.try_clone().unwrap());
    producer.write_all(&request_frame("work", 1, b"ping")).unwrap();

    let delivered = consumer_reader.expect_nullary(opcode::REQUEST, WAIT);
    assert_eq!(find_bytes(&delivered, opcode::PAYLOAD), Some(&b"ping"[..]));
    let mid = find_int(&delivered, opcode::ID).expect("mid on delivered request");

    consumer.write_all(&reply_frame(mid, b"pong")).unwrap();

    let reply = producer_reader.expect_nullary(opcode::REPLY, WAIT);
    assert_eq!(find_int(&reply, opcode::ID), Some(1));
    assert_eq!(find_bytes(&reply, opcode::PAYLOAD), Some(&b"pong"[..]));
}

#[test]
fn broadcast_reaches_every_consumer() {
    let harness = Harness::spawn(ephemeral_config());

    let mut c1 = harness.connect();
    let mut c1_reader = Reader::new(c1.try_clone().unwrap());
    c1.write_all(&consume_frame("news", 0, 2, false)).unwrap();
    c1_reader.expect_nullary(opcode::CONSUMING, WAIT);

    let mut c2 = harness.connect();
    let mut c2_reader = Reader::new(c2.try_clone().unwrap());
    c2.write_all(&consume_frame("news", 0, 2, false)).unwrap();
    c2_reader.expect_nullary(opcode::CONSUMING, WAIT);

    let mut producer = harness.connect();
    producer.write_all(&broadcast_frame("news", b"hello")).unwrap();

    let got1 = c1_reader.expect_nullary(opcode::BROADCAST, WAIT);
    assert_eq!(find_bytes(&got1, opcode::PAYLOAD), Some(&b"hello"[..]));
    let got2 = c2_reader.expect_nullary(opcode::BROADCAST, WAIT);
    assert_eq!(find_bytes(&got2, opcode::PAYLOAD), Some(&b"hello"[..]));
}

#[test]
fn exclusive_contention_promotes_waiter_on_disconnect() {
    let harness = Harness::spawn(ephemeral_config());

    let mut holder = harness.connect();
    let mut holder_reader = Reader::new(holder.try_clone().unwrap());
    holder.write_all(&consume_frame("ex", 0, 2, true)).unwrap();
    holder_reader.expect_nullary(opcode::CONSUMING, WAIT);

    let mut waiter = harness.connect();
    let mut waiter_reader = Reader::new(waiter.try_clone().unwrap());
    waiter.write_all(&consume_frame("ex", 0, 2, true)).unwrap();

    // The second subscriber must not be acknowledged while the exclusive hold stands.
    assert!(waiter_reader.has_no_commands(Duration::from_millis(300)));

    holder.shutdown(std::net::Shutdown::Both).unwrap();
    drop(holder);

    waiter_reader.expect_nullary(opcode::CONSUMING, WAIT);
}

#[test]
fn max_outstanding_throttles_delivery() {
    let harness = Harness::spawn(ephemeral_config());

    let mut consumer = harness.connect();
    let mut consumer_reader = Reader::new(consumer.try_clone().unwrap());
    consumer.write_all(&consume_frame("bounded", 2, 2, false)).unwrap();
    consumer_reader.expect_nullary(opcode::CONSUMING, WAIT);

    let mut producer = harness.connect();
    for n in 1..=3u64 {
        producer.write_all(&request_frame("bounded", n, b"x")).unwrap();
    }

    let first = consumer_reader.expect_nullary(opcode::REQUEST, WAIT);
    let second = consumer_reader.expect_nullary(opcode::REQUEST, WAIT);
    let delivered_ids: Vec<u64> = [first, second]
        .iter()
        .map(|c| find_int(c, opcode::ID).expect("mid"))
        .collect();
    assert_eq!(delivered_ids.len(), 2);

    // A third request should stay queued until one of the first two is replied to.
    assert!(consumer_reader.has_no_commands(Duration::from_millis(300)));

    consumer.write_all(&reply_frame(delivered_ids[0], b"ack")).unwrap();
    consumer_reader.expect_nullary(opcode::REQUEST, WAIT);
}

#[test]
fn disconnecting_target_returns_undelivered_to_producer() {
    let harness = Harness::spawn(ephemeral_config());

    let mut consumer = harness.connect();
    let mut consumer_reader = Reader::new(consumer.try_clone().unwrap());
    consumer.write_all(&consume_frame("flaky", 0, 2, false)).unwrap();
    consumer_reader.expect_nullary(opcode::CONSUMING, WAIT);

    let mut producer = harness.connect();
    let mut producer_reader = Reader::new(producer.try_clone().unwrap());
    producer.write_all(&request_frame("flaky", 7, b"payload")).unwrap();

    let delivered = consumer_reader.expect_nullary(opcode::REQUEST, WAIT);
    assert_eq!(find_int(&delivered, opcode::ID), Some(7));

    consumer.shutdown(std::net::Shutdown::Both).unwrap();
    drop(consumer);

    let undelivered = producer_reader.expect_nullary(opcode::UNDELIVERED, WAIT);
    assert_eq!(find_int(&undelivered, opcode::ID), Some(7));
}

#[test]
fn malformed_terminator_closes_the_connection() {
    let harness = Harness::spawn(ephemeral_config());

    let mut producer = harness.connect();
    // REQUEST with no ID, no queue/qid and no payload set: every required field is
    // missing, so this must be a fatal ProtocolError rather than a silently dropped frame.
    let mut buf = Vec::new();
    clear(&mut buf);
    nullary(&mut buf, opcode::REQUEST);
    producer.write_all(&buf).unwrap();

    let mut tmp = [0u8; 16];
    producer.set_read_timeout(Some(WAIT)).unwrap();
    let read = producer.read(&mut tmp);
    match read {
        Ok(0) => {}
        Err(_) => {}
        Ok(n) => panic!("expected connection close, got {} bytes", n),
    }
}

/// Two brokers, peered one-way: broker B has no knowledge of A at startup, broker A is
/// configured with B's (ephemeral) address as its only peer. A client subscribes to a
/// queue directly on A; A's subscribe advertises the queue over the peer link, so B ends
/// up treating the peer connection as a low-priority consumer. A client then requests
/// against the *same queue name* on B and expects the reply to round-trip back through A.
#[test]
fn federated_request_round_trips_through_peer_link() {
    let harness_b = Harness::spawn(ephemeral_config());

    let mut config_a = ephemeral_config();
    config_a.peers = vec![harness_b.addr.to_string()];
    let harness_a = Harness::spawn(config_a);

    let mut consumer = harness_a.connect();
    let mut consumer_reader = Reader::new(consumer.try_clone().unwrap());
    consumer.write_all(&consume_frame("fed", 0, 2, false)).unwrap();
    consumer_reader.expect_nullary(opcode::CONSUMING, WAIT);

    // Give the background tick loops time to connect the peer link and replay the
    // advertisement before the producer submits its request.
    thread::sleep(Duration::from_millis(300));

    let mut producer = harness_b.connect();
    let mut producer_reader = Reader::new(producer.try_clone().unwrap());
    producer.write_all(&request_frame("fed", 1, b"over-the-wire")).unwrap();

    let delivered = consumer_reader.expect_nullary(opcode::REQUEST, Duration::from_secs(3));
    assert_eq!(find_bytes(&delivered, opcode::PAYLOAD), Some(&b"over-the-wire"[..]));
    let mid = find_int(&delivered, opcode::ID).expect("mid on delivered request");

    consumer.write_all(&reply_frame(mid, b"got-it")).unwrap();

    let reply = producer_reader.expect_nullary(opcode::REPLY, Duration::from_secs(3));
    assert_eq!(find_int(&reply, opcode::ID), Some(1));
    assert_eq!(find_bytes(&reply, opcode::PAYLOAD), Some(&b"got-it"[..]));
}
