use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tinyweb::{ActorModel, Config, MemoryStore, Server, ServerHandle, StorePool, TriggerMode};

struct TestServer {
    handle: ServerHandle,
    _root: tempfile::TempDir,
}

impl TestServer {
    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

fn page(root: &Path, name: &str, body: &[u8]) {
    let path = root.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
}

fn doc_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    page(dir.path(), "judge.html", b"<p>judge</p>");
    page(dir.path(), "log.html", b"<p>login</p>");
    page(dir.path(), "welcome.html", b"<p>welcome</p>");
    page(dir.path(), "logError.html", b"<p>bad login</p>");
    page(dir.path(), "registerError.html", b"<p>register failed</p>");
    page(dir.path(), "empty.html", b"");
    dir
}

fn start_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let root = doc_root();
    let mut config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        doc_root: root.path().to_path_buf(),
        workers: 2,
        max_requests: 64,
        timeslot_secs: 1,
        store_pool_size: 2,
        ..Config::default()
    };
    tweak(&mut config);
    let store = StorePool::memory(MemoryStore::new(), config.store_pool_size).unwrap();
    let handle = Server::new(config).store_pool(store).start().unwrap();
    TestServer {
        handle,
        _root: root,
    }
}

fn start() -> TestServer {
    start_with(|_| {})
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Read one response off a kept-alive stream.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = connect(addr);
    stream.write_all(raw).unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    res
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn empty_file_gets_placeholder_and_close() {
    let server = start();
    let res = exchange(
        server.addr(),
        b"GET /empty.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Length: 26\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    // read_to_string returned, so the server closed the socket.
    assert!(res.ends_with("<html><body></body></html>"));
}

#[test]
fn root_serves_default_page() {
    let server = start();
    let res = exchange(server.addr(), b"GET / HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with("<p>judge</p>"));
}

#[test]
fn registration_then_duplicate() {
    let server = start();
    let post = b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 24\r\n\r\nuser=alice&passwd=secret";

    let first = exchange(server.addr(), post);
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.ends_with("<p>login</p>"));

    let second = exchange(server.addr(), post);
    assert!(second.ends_with("<p>register failed</p>"));

    let login = exchange(
        server.addr(),
        b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 24\r\n\r\nuser=alice&passwd=secret",
    );
    assert!(login.ends_with("<p>welcome</p>"));
}

#[test]
fn missing_file_is_404() {
    let server = start();
    let res = exchange(server.addr(), b"GET /does-not-exist.html HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(res.contains("The requested file was not found on this server."));
}

#[test]
fn malformed_request_line_is_404() {
    let server = start();
    let res = exchange(server.addr(), b"GET /judge.html HTTP/1.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn keep_alive_serves_sequential_requests() {
    for (actor_model, conn_trigger) in [
        (ActorModel::Proactor, TriggerMode::Level),
        (ActorModel::Proactor, TriggerMode::Edge),
        (ActorModel::Reactor, TriggerMode::Level),
        (ActorModel::Reactor, TriggerMode::Edge),
    ] {
        let server = start_with(|c| {
            c.actor_model = actor_model;
            c.conn_trigger = conn_trigger;
            c.listen_trigger = conn_trigger;
        });
        let mut stream = connect(server.addr());
        for _ in 0..3 {
            stream
                .write_all(b"GET /judge.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{actor_model:?}/{conn_trigger:?}");
            assert!(head.contains("Connection: keep-alive\r\n"));
            assert_eq!(body, b"<p>judge</p>");
        }
    }
}

#[test]
fn request_split_across_writes() {
    let server = start();
    let mut stream = connect(server.addr());
    stream.write_all(b"GET /judge.html HT").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"TP/1.1\r\nConnection: close\r").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\n\r\n").unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.ends_with("<p>judge</p>"));
}

#[test]
fn connections_over_the_limit_are_told_busy() {
    let server = start_with(|c| c.max_connections = 1);
    let _held = connect(server.addr());
    assert!(wait_until(Duration::from_secs(2), || server.handle.metrics().live() == 1));

    let mut extra = connect(server.addr());
    let mut reply = String::new();
    extra.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "Internal server busy");
    // Counted before the reply goes out.
    assert_eq!(server.handle.metrics().rejected_busy.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(2), || server.handle.metrics().live() == 1));
}

#[test]
fn idle_connection_is_reaped() {
    let server = start();
    let mut stream = connect(server.addr());
    assert!(wait_until(Duration::from_secs(2), || server.handle.metrics().live() == 1));

    // Three one-second ticks plus slack.
    assert!(wait_until(Duration::from_secs(8), || server.handle.metrics().live() == 0));
    assert_eq!(server.handle.metrics().expired.load(Ordering::Relaxed), 1);

    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn stalled_writer_is_closed_by_timer() {
    let server = start();
    // Far larger than the socket buffers, and the client never reads.
    let big = vec![b'x'; 64 * 1024 * 1024];
    page(server._root.path(), "big.bin", &big);

    let mut stream = connect(server.addr());
    stream
        .write_all(b"GET /big.bin HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.handle.metrics().live() == 1));
    assert!(wait_until(Duration::from_secs(10), || server.handle.metrics().live() == 0));
    assert_eq!(server.handle.metrics().expired.load(Ordering::Relaxed), 1);
    drop(stream);
}

#[test]
fn shutdown_stops_the_server() {
    let server = start();
    let addr = server.addr();
    server.handle.shutdown();
    server.handle.join().unwrap();
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}
