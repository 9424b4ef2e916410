//! End-to-end scenarios (spec.md §8) driven over real loopback TCP — no
//! mocking of the kernel. Each test stands up a `ChannelCore`-based driver
//! or a protocol channel directly, rather than the full `Instance` reactor
//! loop, and pumps it by hand until the expected outcome is observed.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use netreactor::channel::http::{HttpServerChannel, HttpServerHandler};
use netreactor::channel::http_packet::{HttpRequestPacket, HttpResponsePacket};
use netreactor::channel::redis::{RedisChannel, RedisChannelHandler};
use netreactor::channel::{ChannelCore, ChannelDriver, ChannelError, DriverOutcome, InstanceState};
use netreactor::job::{JobHandler, JobManager};
use netreactor::packet::MsgPacket;
use netreactor::poller::Interest;
use netreactor::pool::{HostKey, MultiChannelPool, PoolChannel};
use netreactor::registry::{ChannelName, ChannelRegistry};
use netreactor::resp::Value;
use netreactor::socket::Socket;

fn connected_pair() -> (ChannelCore, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();

    let mut reg: ChannelRegistry<()> = ChannelRegistry::new();
    let name = reg.insert(());
    (ChannelCore::from_connected(name, Socket::from_std(server).unwrap()), client)
}

fn pump_until<F: FnMut() -> bool>(mut done: F, attempts: usize) -> bool {
    for _ in 0..attempts {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// A driver that echoes every byte it reads straight back onto the write
/// buffer, with no framing at all — the simplest possible `ChannelDriver`,
/// used here purely to exercise S1 at the byte level the scenario specifies.
struct EchoDriver {
    core: ChannelCore,
}

impl ChannelDriver for EchoDriver {
    fn name(&self) -> ChannelName {
        self.core.name()
    }
    fn fd(&self) -> RawFd {
        self.core.fd()
    }
    fn instance_state(&self) -> InstanceState {
        self.core.instance_state()
    }
    fn desired_interest(&self) -> Interest {
        self.core.desired_interest()
    }
    fn on_readable(&mut self) -> DriverOutcome {
        match self.core.read_raw() {
            Ok(0) => {
                self.core.set_release();
                DriverOutcome::Release
            }
            Ok(_) => {
                let bytes = self.core.read_buf().read_from_buffer_all();
                self.core.queue_bytes(&bytes);
                DriverOutcome::Continue
            }
            Err(e) if Socket::is_again(&e) => DriverOutcome::Continue,
            Err(_) => {
                self.core.set_release();
                DriverOutcome::Release
            }
        }
    }
    fn on_writable(&mut self) -> DriverOutcome {
        let _ = self.core.drain_write(4);
        DriverOutcome::Continue
    }
    fn on_error(&mut self, _errno: i32) -> DriverOutcome {
        self.core.set_release();
        DriverOutcome::Release
    }
    fn set_expired(&mut self) {
        self.core.set_expired();
    }
    fn set_release(&mut self) {
        self.core.set_release();
    }
}

/// S1 — Echo server: the client's 6 bytes come back unchanged within
/// 100ms, and closing the client flips the server channel to `Delete`.
#[test]
fn s1_echo_server_round_trips_and_releases_on_close() {
    let (core, mut client) = connected_pair();
    let mut driver = EchoDriver { core };

    client.write_all(b"hello\n").unwrap();

    let start = Instant::now();
    pump_until(
        || {
            driver.on_readable();
            driver.on_writable();
            driver.core.write_buf().is_empty() && driver.core.read_buf().is_empty()
        },
        50,
    );
    assert!(start.elapsed() < Duration::from_millis(100));

    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut back = [0u8; 6];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"hello\n");

    drop(client);
    let released = pump_until(
        || driver.on_readable() == DriverOutcome::Release,
        50,
    );
    assert!(released);
    assert_eq!(driver.instance_state(), InstanceState::Normal);
    driver.set_release();
    assert_eq!(driver.instance_state(), InstanceState::Delete);
}

/// spec.md §4.4's two-step teardown: `set_expired()` only requests a
/// flush-and-release, it does not close anything by itself. Once the
/// pending write drains, the channel must promote itself to `Delete`
/// without any further external push.
#[test]
fn expired_channel_promotes_to_delete_once_the_write_buffer_drains() {
    let (core, mut client) = connected_pair();
    let mut driver = EchoDriver { core };

    driver.core.queue_bytes(b"farewell");
    driver.set_expired();
    assert_eq!(driver.instance_state(), InstanceState::Expired);

    let drained = pump_until(
        || {
            driver.on_writable();
            driver.core.write_buf().is_empty()
        },
        50,
    );
    assert!(drained);
    assert_eq!(driver.instance_state(), InstanceState::Delete);

    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut back = [0u8; 8];
    client.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"farewell");
}

struct RecordingHttpServer {
    requests: std::sync::Arc<std::sync::Mutex<Vec<HttpRequestPacket>>>,
}

impl HttpServerHandler for RecordingHttpServer {
    fn on_request(&mut self, _name: ChannelName, req: &HttpRequestPacket) {
        self.requests.lock().unwrap().push(req.clone());
    }
    fn on_error(&mut self, _name: ChannelName, _err: ChannelError) {}
}

/// S2 — HTTP GET: a `200 OK` with a fixed JSON body and matching
/// `Content-Length` comes back for any `GET /`.
#[test]
fn s2_http_get_returns_fixed_json_body() {
    let (core, mut client) = connected_pair();
    let requests = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut channel = HttpServerChannel::new(core, RecordingHttpServer { requests: requests.clone() });

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    pump_until(
        || {
            channel.on_readable();
            !requests.lock().unwrap().is_empty()
        },
        20,
    );
    assert_eq!(requests.lock().unwrap()[0].uri, "/");

    let mut resp = HttpResponsePacket::new(200, "OK");
    resp.headers.set("Content-Type", "application/json");
    resp.headers.set("Content-Length", "8");
    resp.body = b"{\"ok\":1}".to_vec();
    channel.respond(&resp);
    pump_until(
        || {
            channel.on_writable();
            channel.core_mut().write_buf().is_empty()
        },
        20,
    );

    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = Vec::new();
    let mut scratch = [0u8; 256];
    loop {
        match client.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                if buf.len() >= 8 && buf.ends_with(b"{\"ok\":1}") {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 8"));
    assert!(text.ends_with("{\"ok\":1}"));
}

struct CloseEchoServer;

impl HttpServerHandler for CloseEchoServer {
    fn on_request(&mut self, _name: ChannelName, _req: &HttpRequestPacket) {}
    fn on_error(&mut self, _name: ChannelName, _err: ChannelError) {}
}

/// S3 — HTTP chunk-unknown-length: a response with no `Content-Length`
/// delivers its body once the peer closes, not before.
#[test]
fn s3_http_response_without_content_length_completes_on_close() {
    let (core, mut client) = connected_pair();
    let mut channel = HttpServerChannel::new(core, CloseEchoServer);

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    pump_until(
        || {
            channel.on_readable();
            true
        },
        5,
    );

    let mut resp = HttpResponsePacket::new(200, "OK");
    resp.headers.set("Connection", "close");
    resp.body = b"hello world!".to_vec();
    channel.respond(&resp);
    pump_until(
        || {
            channel.on_writable();
            channel.core_mut().write_buf().is_empty()
        },
        20,
    );
    channel.core_mut().close();

    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).unwrap();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.contains("Connection: close"));
    assert!(text.ends_with("hello world!"));
    assert!(!text.contains("Content-Length"));
}

/// S4 — Job timeout: a job keyed to an endpoint that never answers fires
/// its timeout hook exactly once, then is gone.
#[test]
fn s4_job_fires_timeout_exactly_once_then_is_destroyed() {
    struct NeverAnswers {
        fired: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl JobHandler<MsgPacket> for NeverAnswers {
        fn on_timeout(&mut self, _age: Duration) -> bool {
            self.fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }
    }

    let mut jobs: JobManager<MsgPacket> = JobManager::new();
    let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let key = jobs.add(Box::new(NeverAnswers { fired: fired.clone() }));

    let limit = Duration::from_millis(200);
    assert_eq!(jobs.check_timeout(limit), 0);
    assert!(jobs.job_age(key).is_some());

    std::thread::sleep(Duration::from_millis(220));
    assert_eq!(jobs.check_timeout(limit), 1);
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(jobs.job_age(key).is_none());

    // A second sweep sees no more jobs at all, let alone a second fire.
    assert_eq!(jobs.check_timeout(limit), 0);
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

struct RecordingRedisHandler {
    values: std::sync::Arc<std::sync::Mutex<Vec<Value>>>,
}

impl RedisChannelHandler for RecordingRedisHandler {
    fn on_read_value(&mut self, _name: ChannelName, value: &Value) {
        self.values.lock().unwrap().push(value.clone());
    }
    fn on_error(&mut self, _name: ChannelName, _err: ChannelError) {}
}

/// S5 — RESP parse over a real socket, one byte at a time: exactly one
/// value arrives, an array of a bulk string and an integer.
#[test]
fn s5_resp_array_parses_byte_at_a_time_over_a_real_socket() {
    let (core, mut client) = connected_pair();
    let values = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut channel = RedisChannel::new(core, RecordingRedisHandler { values: values.clone() });

    let wire = b"*2\r\n$5\r\nhello\r\n:42\r\n";
    for &b in wire {
        client.write_all(&[b]).unwrap();
        channel.on_readable();
    }
    pump_until(|| !values.lock().unwrap().is_empty(), 50);

    let got = values.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], Value::array(vec![Value::bulk("hello"), Value::Integer(42)]));
}

struct ReconnectingChannel {
    name: ChannelName,
    gname: String,
    host: HostKey,
    connected: bool,
    hello_count: usize,
}

impl ChannelDriver for ReconnectingChannel {
    fn name(&self) -> ChannelName {
        self.name
    }
    fn fd(&self) -> RawFd {
        -1
    }
    fn instance_state(&self) -> InstanceState {
        InstanceState::Normal
    }
    fn desired_interest(&self) -> Interest {
        Interest::readable()
    }
    fn on_readable(&mut self) -> DriverOutcome {
        DriverOutcome::Continue
    }
    fn on_writable(&mut self) -> DriverOutcome {
        DriverOutcome::Continue
    }
    fn on_error(&mut self, _errno: i32) -> DriverOutcome {
        DriverOutcome::Release
    }
    fn set_expired(&mut self) {}
    fn set_release(&mut self) {}
}

impl PoolChannel for ReconnectingChannel {
    fn group_name(&self) -> &str {
        &self.gname
    }
    fn host(&self) -> &HostKey {
        &self.host
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    fn send_packet(&mut self, _pk: &MsgPacket) {}
    fn hello_packet(&mut self) -> (Option<MsgPacket>, bool) {
        self.hello_count += 1;
        (Some(MsgPacket::new("HELLO", 0, 0, Vec::new())), true)
    }
    fn check_hello_packet(&mut self, _pk: &MsgPacket) -> Option<String> {
        Some("peer".to_string())
    }
    fn begin_reconnect(&mut self) {
        self.connected = false;
    }
    fn note_connected(&mut self, _peer_name: String) {
        self.connected = true;
    }
    fn note_disconnected(&mut self) {
        self.connected = false;
    }
}

/// S6 — Multi pool reconnect: one group, one host, two channels. Dropping
/// the peer disconnects both; re-arming and reconnecting both brings them
/// back, and the pool's rotation alternates between them again.
#[test]
fn s6_pool_reconnects_both_channels_and_resumes_alternating_rotation() {
    let mut pool = MultiChannelPool::new("cache", Duration::from_millis(50));

    let mut reg: ChannelRegistry<()> = ChannelRegistry::new();
    let a = pool.add(Box::new(ReconnectingChannel {
        name: reg.insert(()),
        gname: "g1".to_string(),
        host: ("peer".to_string(), 6379),
        connected: true,
        hello_count: 0,
    }));
    let b = pool.add(Box::new(ReconnectingChannel {
        name: reg.insert(()),
        gname: "g1".to_string(),
        host: ("peer".to_string(), 6379),
        connected: true,
        hello_count: 0,
    }));

    let first = pool.next_channel_in_group("g1").unwrap();
    let second = pool.next_channel_in_group("g1").unwrap();
    assert_ne!(first, second);
    assert!([a, b].contains(&first) && [a, b].contains(&second));

    // Peer goes away: both note_disconnected, as `instance.rs` would drive
    // on a read/write error from the reactor.
    pool.on_channel_error(a, ChannelError::ReadClose);
    pool.on_channel_error(b, ChannelError::ReadClose);
    assert_eq!(pool.next_channel_in_group("g1"), None, "no connected channel left");

    // TIMER_RECONNECT_INIT fires for each: begin_reconnect, then the
    // (simulated) connect succeeds and the hello exchange completes.
    pool.channel_mut(a).unwrap().begin_reconnect();
    pool.channel_mut(a).unwrap().note_connected("peer".to_string());
    pool.channel_mut(b).unwrap().begin_reconnect();
    pool.channel_mut(b).unwrap().note_connected("peer".to_string());

    let first = pool.next_channel_in_group("g1").unwrap();
    let second = pool.next_channel_in_group("g1").unwrap();
    assert_ne!(first, second, "rotation alternates between the two reconnected channels");
    assert!([a, b].contains(&first) && [a, b].contains(&second));
}
