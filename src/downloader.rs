//! A single outbound connection to an origin server.
//!
//! Grounded in `original_source/lib/exaproxy/reactor/content/manager.py`'s
//! `getDownloader`/`startDownload`/`sendSocketData`/`readData` handling,
//! where the "downloader" is an object wrapping one client's outbound
//! socket plus whatever bytes are still pending delivery in either
//! direction. Here it owns a non-blocking `std::net::TcpStream` directly
//! rather than a tokio socket, per spec.md §5's single-threaded,
//! non-blocking core requirement.

use crate::error::{ContentError, Result};
use crate::pool::{BufferPool, PooledItem};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};

/// Which verb opened this downloader. Only `Connect`/`Intercept` produce a
/// synthetic handshake on `start_conversation` (spec.md §4.2's
/// `startConversation`); all three methods flush the buffered request once
/// established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Download,
    Connect,
    Intercept,
}

/// Where a `Downloader` sits in its lifecycle. Mirrors the `opening` vs
/// `established` registries the original keeps as two separate dicts;
/// collapsing them into one field is the registry simplification recorded
/// in spec.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Outbound `connect()` has been issued but not yet confirmed writable.
    Opening,
    /// Outbound connection is up; request/response bytes may flow.
    Established,
}

/// One client's outbound connection and its pending buffers.
pub struct Downloader {
    pub client: u64,
    pub host: String,
    pub port: u16,
    pub method: Method,
    pub phase: Phase,
    socket: TcpStream,
    /// The "pending request bytes" and "internal send buffer" attributes
    /// of spec.md §4.2 collapsed into one: whatever hasn't reached the
    /// wire yet, whether that's the initial stash from construction or a
    /// later write that couldn't be flushed whole. `write_data` always
    /// appends here before attempting to flush, so bytes are never
    /// written to the socket out of submission order (spec.md §5).
    buffer: PooledItem<Vec<u8>>,
    sent4: u64,
    sent6: u64,
}

impl Downloader {
    /// Issue a non-blocking `connect()` to `host:port`, binding the local
    /// address per the address family (spec.md §4.2's IPv4/IPv6 bind
    /// selection), and return a `Downloader` in `Phase::Opening`.
    pub fn construct(
        client: u64,
        host: String,
        port: u16,
        method: Method,
        bind4: IpAddr,
        bind6: IpAddr,
        pool: &BufferPool,
    ) -> Result<Self> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ContentError::InvalidHost(host.clone()))?;

        let bind_addr = match ip {
            IpAddr::V4(_) => SocketAddr::new(bind4, 0),
            IpAddr::V6(_) => SocketAddr::new(bind6, 0),
        };

        let socket = connect_nonblocking(bind_addr, SocketAddr::new(ip, port))?;

        Ok(Self {
            client,
            host,
            port,
            method,
            phase: Phase::Opening,
            socket,
            buffer: pool.get(),
            sent4: 0,
            sent6: 0,
        })
    }

    /// Called on first writable readiness: confirm the non-blocking
    /// `connect()` actually succeeded (via `SO_ERROR`), and for
    /// `Connect`/`Intercept` produce the synthetic `HTTP/1.1 200` handshake
    /// the client is waiting for. Returns `(ok, response_bytes,
    /// still_buffered)`; `ok` false means the connect failed and the
    /// caller must degrade per spec.md §4.3.3. `still_buffered` reports
    /// whether the stashed request (if any) still has unflushed residue,
    /// so the caller can wire up the `write_download` subscription per
    /// §4.3.3 step 4 without losing track of it. Mirrors
    /// `startConversation`.
    pub fn start_conversation(&mut self) -> Result<(bool, Option<Vec<u8>>, bool)> {
        let connect_ok = matches!(self.socket.take_error(), Ok(None));
        if !connect_ok {
            return Ok((false, None, false));
        }

        self.phase = Phase::Established;

        let response = match self.method {
            Method::Connect | Method::Intercept => {
                Some(b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec())
            }
            Method::Download => None,
        };

        let still_buffered = self.flush()?.0;

        Ok((true, response, still_buffered))
    }

    /// The raw fd backing this connection's socket, for a `Poller` to
    /// register readiness interest against without taking ownership away
    /// from this `Downloader`.
    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.socket.as_raw_fd()
    }

    /// Append `data` to the internal send buffer and attempt to flush it.
    /// Returns `(still_buffered, sent_v4, sent_v6)`: whether residue
    /// remains after this attempt, and how many bytes were actually
    /// transmitted this call, tagged by the peer's address family.
    /// Existing residue is always flushed before any newly appended byte,
    /// so writes never reach the wire out of submission order.
    pub fn write_data(&mut self, data: &[u8]) -> Result<(bool, u64, u64)> {
        self.buffer.extend_from_slice(data);
        self.flush()
    }

    /// Append `data` to the internal send buffer without attempting to
    /// send it (used while still in `Phase::Opening`, where the socket
    /// isn't connected yet). Returns whether the buffer is non-empty.
    pub fn buffer_data(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        !self.buffer.is_empty()
    }

    fn flush(&mut self) -> Result<(bool, u64, u64)> {
        if self.buffer.is_empty() {
            return Ok((false, 0, 0));
        }
        match self.socket.write(&self.buffer) {
            Ok(n) => {
                self.buffer.drain(..n);
                let (v4, v6) = self.account_sent(n);
                Ok((!self.buffer.is_empty(), v4, v6))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((true, 0, 0)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one chunk from the outbound socket. `Ok(None)` means the
    /// socket would block right now; `Ok(Some(bytes))` with an empty
    /// `Vec` means the origin closed the connection, matching the
    /// original's "terminate on None data" rule in `readData`.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<Option<Vec<u8>>> {
        match self.socket.read(buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    pub fn total_sent4(&self) -> u64 {
        self.sent4
    }

    pub fn total_sent6(&self) -> u64 {
        self.sent6
    }

    fn account_sent(&mut self, n: usize) -> (u64, u64) {
        let n = n as u64;
        match self.socket.local_addr() {
            Ok(SocketAddr::V6(_)) => {
                self.sent6 += n;
                (0, n)
            }
            _ => {
                self.sent4 += n;
                (n, 0)
            }
        }
    }
}

fn connect_nonblocking(bind_addr: SocketAddr, peer: SocketAddr) -> Result<TcpStream> {
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let sock = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    sock.bind(&bind_addr.into())?;
    match sock.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_in_progress()) => {}
        Err(e) => return Err(ContentError::SocketCreate(e.to_string())),
    }
    Ok(sock.into())
}

/// `EINPROGRESS`, the errno a non-blocking `connect()` returns while the
/// handshake is still underway. Hardcoded rather than pulled from `libc`
/// since it is the same value (115 on Linux, 36 on BSD/macOS) on every
/// platform `socket2` supports here.
#[cfg(target_os = "linux")]
fn libc_in_progress() -> i32 {
    115
}

#[cfg(not(target_os = "linux"))]
fn libc_in_progress() -> i32 {
    36
}
