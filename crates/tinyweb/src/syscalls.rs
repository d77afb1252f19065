// src/syscalls.rs
//! Thin wrappers over the libc calls the server needs: listening sockets,
//! accept, epoll, recv/sendmsg, pipes and read-only file mappings.
//!
//! Everything here is Linux-only; the readiness facility is epoll.

use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use serde::Deserialize;
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// How a descriptor is registered with epoll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Level,
    Edge,
}

/// Direction of readiness a descriptor is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

// ---- Socket Operations ----

/// Create a non-blocking listening TCP socket.
///
/// With `linger` set, closing a socket with unsent data blocks for up to
/// one second instead of discarding it.
pub fn create_listen_socket(addr: &SocketAddr, linger: bool) -> ServerResult<c_int> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let opt = libc::linger {
            l_onoff: linger as c_int,
            l_linger: linger as c_int,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt as *const _ as *const c_void,
            mem::size_of_val(&opt) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let (storage, len) = to_sockaddr(addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Address a bound socket ended up on (resolves port 0).
pub fn local_addr(fd: c_int) -> ServerResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        from_sockaddr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported address family").into()
        })
    }
}

/// Accept one pending connection. `Ok(None)` when nothing is pending.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let peer = from_sockaddr(&storage)
            .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok(Some((fd, peer)))
    }
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = match addr {
            SocketAddr::V4(a) => {
                let sin = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(a) => {
                let sin6 = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                sin6.sin6_scope_id = a.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as socklen_t)
    }
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    unsafe {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

// ---- Epoll Operations ----

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

pub use libc::epoll_event;

/// Owned epoll instance. Tokens are the registered descriptors themselves.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn event_bits(interest: Interest, trigger: TriggerMode, one_shot: bool) -> u32 {
        let mut bits = match interest {
            Interest::Readable => EPOLLIN,
            Interest::Writable => EPOLLOUT,
        } | EPOLLRDHUP;
        if trigger == TriggerMode::Edge {
            bits |= libc::EPOLLET as u32;
        }
        if one_shot {
            bits |= libc::EPOLLONESHOT as u32;
        }
        bits
    }

    fn ctl(&self, op: c_int, fd: c_int, bits: u32) -> ServerResult<()> {
        let mut event = epoll_event {
            events: bits,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Register `fd`. Connection sockets use `one_shot` so that only one
    /// thread ever handles a given readiness event.
    pub fn add(
        &self,
        fd: c_int,
        interest: Interest,
        trigger: TriggerMode,
        one_shot: bool,
    ) -> ServerResult<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            Self::event_bits(interest, trigger, one_shot),
        )
    }

    /// Re-arm a one-shot registration for the next direction.
    pub fn modify(&self, fd: c_int, interest: Interest, trigger: TriggerMode) -> ServerResult<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            Self::event_bits(interest, trigger, true),
        )
    }

    pub fn delete(&self, fd: c_int) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for events. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> ServerResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Socket I/O ----

/// Single `recv` into `buf`. Would-block surfaces as `ErrorKind::WouldBlock`.
pub fn recv_into(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Scatter/gather send of up to two segments, without raising SIGPIPE.
pub fn send_vectored(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let mut count = 0;
    for buf in bufs.iter().filter(|b| !b.is_empty()).take(2) {
        iovecs[count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        count += 1;
    }
    if count == 0 {
        return Ok(0);
    }

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = count as _;
        let res = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Best-effort plain send, used for the "server busy" notice.
pub fn send_best_effort(fd: c_int, data: &[u8]) {
    unsafe {
        libc::send(fd, data.as_ptr() as *const c_void, data.len(), libc::MSG_NOSIGNAL);
    }
}

// ---- Notification Pipes ----

/// Create a pipe with both ends non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> ServerResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one notification byte. A full pipe already guarantees a wake-up,
/// so would-block is ignored.
pub fn notify_pipe(write_fd: c_int, byte: u8) {
    unsafe {
        libc::write(write_fd, &byte as *const u8 as *const c_void, 1);
    }
}

/// Read every pending notification byte into `out`.
pub fn drain_pipe(read_fd: c_int, out: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
}

/// Owned notification pipe; both ends close on drop.
pub struct Pipe {
    read_fd: c_int,
    write_fd: c_int,
}

impl Pipe {
    pub fn new() -> ServerResult<Self> {
        let (read_fd, write_fd) = create_pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> c_int {
        self.read_fd
    }

    pub fn notify(&self, byte: u8) {
        notify_pipe(self.write_fd, byte);
    }

    pub fn drain(&self, out: &mut Vec<u8>) -> io::Result<()> {
        drain_pipe(self.read_fd, out)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        close_fd(self.read_fd);
        close_fd(self.write_fd);
    }
}

// ---- File Mappings ----

/// Read-only private mapping of a whole file, unmapped on drop.
pub struct FileMapping {
    addr: *mut c_void,
    len: usize,
}

// The mapping is private and read-only; the pointer is never written.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Map the first `len` bytes of `path`. `len` must be non-zero.
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            let err = io::Error::last_os_error();
            libc::close(fd);
            if addr == libc::MAP_FAILED {
                return Err(err);
            }
            Ok(Self { addr, len })
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn listen_accept_and_exchange_bytes() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listen_fd = create_listen_socket(&addr, false).unwrap();
        let bound = local_addr(listen_fd).unwrap();
        assert_ne!(bound.port(), 0);

        assert!(accept_connection(listen_fd).unwrap().is_none());

        let mut client = TcpStream::connect(bound).unwrap();
        client.write_all(b"ping").unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = accept_connection(listen_fd).unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (fd, peer) = accepted.expect("connection accepted");
        assert_eq!(peer.ip(), bound.ip());

        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            match recv_into(fd, &mut buf[got..]) {
                Ok(n) => {
                    got += n;
                    if got == 4 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        assert_eq!(&buf[..4], b"ping");

        let sent = send_vectored(fd, &[b"po", b"ng"]).unwrap();
        assert_eq!(sent, 4);
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        close_fd(fd);
        close_fd(listen_fd);
    }

    #[test]
    fn linger_option_is_applied_to_listener() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        for enabled in [false, true] {
            let fd = create_listen_socket(&addr, enabled).unwrap();
            let mut opt = libc::linger {
                l_onoff: 0,
                l_linger: 0,
            };
            let mut len = mem::size_of_val(&opt) as socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &mut opt as *mut _ as *mut c_void,
                    &mut len,
                )
            };
            assert_eq!(rc, 0);
            assert_eq!(opt.l_onoff != 0, enabled);
            close_fd(fd);
        }
    }

    #[test]
    fn pipe_round_trips_notifications() {
        let (rd, wr) = create_pipe().unwrap();
        notify_pipe(wr, 1);
        notify_pipe(wr, 2);
        let mut out = Vec::new();
        drain_pipe(rd, &mut out).unwrap();
        assert_eq!(out, vec![1, 2]);
        out.clear();
        drain_pipe(rd, &mut out).unwrap();
        assert!(out.is_empty());
        close_fd(rd);
        close_fd(wr);

        let pipe = Pipe::new().unwrap();
        pipe.notify(7);
        pipe.drain(&mut out).unwrap();
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn file_mapping_exposes_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mapped bytes").unwrap();
        file.flush().unwrap();

        let mapping = FileMapping::open(file.path(), 12).unwrap();
        assert_eq!(mapping.as_slice(), b"mapped bytes");
        assert!(FileMapping::open(file.path(), 0).is_err());
    }
}
