// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain (unencrypted) UDP and TCP transports.
//!
//! Socket construction and best-effort option application
//! (`SO_KEEPALIVE`/`TCP_NODELAY`/`SO_SNDBUF`) goes through `socket2` before
//! handing the socket off to `mio`.

use crate::addr::Family;
use crate::config::ManagerConfig;
use crate::error::EngineError;
use crate::record::Endpoint;
use crate::transport::{SendOutcome, Transport};
use socket2::{Protocol as SockProtocol, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use mio::net::{TcpStream, UdpSocket};
use mio::Token;

/// Matches the original daemon's `SEND_TIMEOUT_USEC`: how long a send waits
/// for the socket to become writable again after `EAGAIN` before giving up.
const SEND_WAIT_TIMEOUT: Duration = Duration::from_millis(200);

enum Inner {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

pub struct PlainTransport {
    inner: Inner,
    token: Token,
    /// TCP only: true once the non-blocking `connect()` has completed.
    connected: bool,
}

impl PlainTransport {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Register the underlying socket with the reactor. Called once right
    /// after construction, before returning control to the poll loop.
    pub fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let interest = mio::Interest::READABLE | mio::Interest::WRITABLE;
        match &mut self.inner {
            Inner::Udp(socket) => registry.register(socket, self.token, interest),
            Inner::Tcp(stream) => registry.register(stream, self.token, interest),
        }
    }

    /// Consume the wrapper and hand back the raw `mio::net::TcpStream`, for
    /// handing off to `SecureTransport::start_tls` once the connect
    /// completes. `None` if this wraps a UDP socket.
    pub fn into_tcp_stream(self) -> Option<TcpStream> {
        match self.inner {
            Inner::Tcp(stream) => Some(stream),
            Inner::Udp(_) => None,
        }
    }

    /// As above, for DTLS over a connected `mio::net::UdpSocket`.
    pub fn into_udp_socket(self) -> Option<UdpSocket> {
        match self.inner {
            Inner::Udp(socket) => Some(socket),
            Inner::Tcp(_) => None,
        }
    }

    /// Bind and connect a UDP socket to `endpoint`. UDP has no handshake;
    /// `connect()` on a datagram socket only fixes the peer address so
    /// `write`/`send` can be used instead of `send_to`.
    pub fn connect_udp(endpoint: &Endpoint, config: &ManagerConfig, token: Token) -> Result<Self, EngineError> {
        let domain = Family::of(&endpoint.addr).domain();
        let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))
            .map_err(EngineError::Connect)?;
        socket.set_nonblocking(true).map_err(EngineError::Connect)?;
        if config.send_buffer > 0 {
            let _ = socket.set_send_buffer_size(config.send_buffer);
        }
        socket.connect(&endpoint.socket_addr().into()).map_err(EngineError::Connect)?;

        let std_socket: StdUdpSocket = socket.into();
        let mio_socket = UdpSocket::from_std(std_socket);
        Ok(Self { inner: Inner::Udp(mio_socket), token, connected: true })
    }

    /// Begin a non-blocking TCP connect. Readiness (writable) means the
    /// connect either succeeded or failed; the caller checks `SO_ERROR` via
    /// `take_error` on the next writable event.
    pub fn connect_tcp(endpoint: &Endpoint, config: &ManagerConfig, token: Token) -> Result<Self, EngineError> {
        let domain = Family::of(&endpoint.addr).domain();
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))
            .map_err(EngineError::Connect)?;
        socket.set_nonblocking(true).map_err(EngineError::Connect)?;
        apply_tcp_options(&socket, config);

        let addr: SocketAddr = endpoint.socket_addr();
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(EngineError::Connect(e)),
        }

        let std_stream: StdTcpStream = socket.into();
        let mio_stream = TcpStream::from_std(std_stream);
        Ok(Self { inner: Inner::Tcp(mio_stream), token, connected: false })
    }

    /// Call when a writable event arrives on a connecting TCP socket. `Ok(true)`
    /// means the connect finished successfully.
    pub fn check_tcp_connected(&mut self) -> Result<bool, EngineError> {
        let Inner::Tcp(stream) = &self.inner else { return Ok(self.connected) };
        if self.connected {
            return Ok(true);
        }
        match stream.take_error() {
            Ok(None) => {
                self.connected = true;
                Ok(true)
            }
            Ok(Some(e)) => Err(EngineError::Connect(e)),
            Err(e) => Err(EngineError::Connect(e)),
        }
    }
}

fn apply_tcp_options(socket: &Socket, config: &ManagerConfig) {
    if config.no_delay {
        let _ = socket.set_nodelay(true);
    }
    if config.keepalive {
        let mut keepalive = socket2::TcpKeepalive::new()
            .with_time(config.keepalive_time)
            .with_interval(config.keepalive_interval);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            keepalive = keepalive.with_retries(config.keepalive_count);
        }
        let _ = socket.set_tcp_keepalive(&keepalive);
    }
    if config.send_buffer > 0 {
        let _ = socket.set_send_buffer_size(config.send_buffer);
    }
}

impl Transport for PlainTransport {
    fn send(&mut self, parts: &[std::borrow::Cow<'_, str>]) -> Result<SendOutcome, EngineError> {
        match &mut self.inner {
            Inner::Udp(socket) => {
                // Datagram: every gather-list entry is concatenated first so
                // one record becomes exactly one datagram (no boundary
                // between parts), then sent in one syscall.
                let mut buf = Vec::new();
                for p in parts {
                    buf.extend_from_slice(p.as_bytes());
                }
                let fd = socket.as_raw_fd();
                send_non_blocking(|b| socket.send(b), |timeout| wait_for_writable(fd, timeout), &buf)
            }
            Inner::Tcp(stream) => {
                let mut buf = Vec::new();
                for p in parts {
                    buf.extend_from_slice(p.as_bytes());
                }
                let fd = stream.as_raw_fd();
                send_non_blocking(|b| stream.write(b), |timeout| wait_for_writable(fd, timeout), &buf)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.connected
    }
}

/// Loop a non-blocking write until the whole buffer is accepted, a real I/O
/// error, or a bounded wait for writable readiness times out. `MSG_NOSIGNAL`
/// semantics are implicit on Linux stream sockets configured without
/// `SO_NOSIGPIPE`; `write`'s `BrokenPipe` is mapped the same as any other
/// transport error rather than raising `SIGPIPE`.
///
/// On `EAGAIN`, waits up to `SEND_WAIT_TIMEOUT` for the socket to become
/// writable rather than returning control to the reactor immediately:
/// `EngineError::Timeout` on expiry, otherwise retries the write. `wait`
/// is injected so tests can exercise the loop without a real socket.
fn send_non_blocking(
    mut write: impl FnMut(&[u8]) -> io::Result<usize>,
    mut wait: impl FnMut(Duration) -> io::Result<bool>,
    buf: &[u8],
) -> Result<SendOutcome, EngineError> {
    let mut sent = 0;
    while sent < buf.len() {
        match write(&buf[sent..]) {
            Ok(0) => return Err(EngineError::TransportClosed),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match wait(SEND_WAIT_TIMEOUT) {
                Ok(true) => continue,
                Ok(false) => return Err(EngineError::Timeout),
                Err(e) => return Err(EngineError::TransportBroken(e)),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::TransportBroken(e)),
        }
    }
    Ok(SendOutcome::Sent)
}

/// Block for up to `timeout` waiting for `fd` to become writable. Returns
/// `Ok(false)` on timeout, never on error (a real `poll` failure is an
/// `Err`).
fn wait_for_writable(fd: std::os::unix::io::RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    let timeout_ms: libc::c_int = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0 && (pollfd.revents & libc::POLLOUT) != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_non_blocking_times_out_when_never_writable() {
        let mut calls = 0;
        let result = send_non_blocking(
            |_| {
                calls += 1;
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            },
            |_timeout| Ok(false),
            b"hello",
        );
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(EngineError::Timeout)));
    }

    #[test]
    fn send_non_blocking_retries_after_wait_reports_writable() {
        let mut attempts = 0;
        let result = send_non_blocking(
            |buf| {
                attempts += 1;
                if attempts == 1 {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                } else {
                    Ok(buf.len())
                }
            },
            |_timeout| Ok(true),
            b"hello",
        );
        assert_eq!(attempts, 2);
        assert_eq!(result.unwrap(), SendOutcome::Sent);
    }

    #[test]
    fn send_non_blocking_loops_on_partial_writes() {
        let mut remaining = 5usize;
        let result = send_non_blocking(
            |buf| {
                remaining -= 1;
                if remaining == 0 {
                    Ok(buf.len())
                } else {
                    Ok(1)
                }
            },
            |_timeout| Ok(true),
            b"hello",
        );
        assert_eq!(result.unwrap(), SendOutcome::Sent);
    }

    #[test]
    fn send_non_blocking_zero_write_is_closed() {
        let result = send_non_blocking(|_| Ok(0), |_timeout| Ok(true), b"hello");
        assert!(matches!(result, Err(EngineError::TransportClosed)));
    }
}
