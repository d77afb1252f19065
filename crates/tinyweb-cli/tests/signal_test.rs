use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
fn sigterm_stops_the_server_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let port = free_port();
    let mut child = Command::new(env!("CARGO_BIN_EXE_tinyweb"))
        .args(["--host", "127.0.0.1", "-p", &port.to_string(), "-c", "1", "-t", "2"])
        .arg("--root")
        .arg(root.path())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(("127.0.0.1", port)).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        thread::sleep(Duration::from_millis(20));
    }
    // The handler is installed right after the listener comes up.
    thread::sleep(Duration::from_millis(300));

    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);

    let status = match wait_for_exit(&mut child, Duration::from_secs(5)) {
        Some(status) => status,
        None => {
            let _ = child.kill();
            panic!("server ignored SIGTERM");
        }
    };
    assert!(status.success(), "exited with {status:?}");
}
