use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::time::Duration;

use log::{debug, trace};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{deadline_of, is_interrupted, is_would_block, wait_ready, SocketIo};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::sys;
use crate::Interest;

/// Largest payload a v4 datagram can carry; receive buffers are allocated
/// at this size so nothing is ever truncated.
const UDP_RECV_BUF: usize = 65_535;

fn new_v4_datagram() -> Result<Socket> {
    let ty = Type::DGRAM;
    // Use `SOCK_NONBLOCK` on platforms that support it.
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let ty = ty.nonblocking();
    let socket = Socket::new(Domain::IPV4, ty, Some(Protocol::UDP)).map_err(Error::from_io)?;
    // Platforms that don't support `SOCK_NONBLOCK`.
    #[cfg(not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    socket.set_nonblocking(true).map_err(Error::from_io)?;
    Ok(socket)
}

/// A UDP socket with task-level blocking send and receive.
///
/// On Linux multi-datagram receives and sends are batched through
/// `recvmmsg(2)`/`sendmmsg(2)`; elsewhere the same semantics come from
/// looping the single-shot calls.
#[derive(Debug)]
pub struct UdpSocket {
    io: SocketIo,
}

impl UdpSocket {
    /// Binds a socket to `addr` for receiving and sending.
    pub fn bind(addr: SocketAddrV4) -> Result<UdpSocket> {
        let socket = new_v4_datagram()?;
        socket
            .bind(&std::net::SocketAddr::V4(addr).into())
            .map_err(Error::from_io)?;
        let socket = UdpSocket {
            io: SocketIo::new(OwnedFd::from(socket)),
        };
        debug!(
            "udp socket bound to {} (fd {})",
            socket.local_addr()?,
            socket.io.raw()?
        );
        Ok(socket)
    }

    /// An unbound, send-only socket.
    pub fn unbound() -> Result<UdpSocket> {
        let socket = new_v4_datagram()?;
        Ok(UdpSocket {
            io: SocketIo::new(OwnedFd::from(socket)),
        })
    }

    /// Enables or disables `SO_BROADCAST`.
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.with_sock(|sock| sock.set_broadcast(on))
    }

    pub fn broadcast(&self) -> Result<bool> {
        self.with_sock(|sock| sock.broadcast())
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        sys::net::local_addr(self.io.raw()?).map_err(Error::from_io)
    }

    /// Sends one datagram carrying the buffer's live window to `dest`.
    ///
    /// On success the window is fully consumed.
    pub fn send_to(
        &self,
        buf: &mut Buffer,
        dest: SocketAddrV4,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = deadline_of(timeout);
        loop {
            let fd = self.io.raw()?;
            match sys::net::send_to(fd, buf.payload(), &dest) {
                Ok(n) => {
                    trace!("sent {} byte datagram to {}", n, dest);
                    buf.advance(n.min(buf.len()));
                    return Ok(());
                }
                Err(ref err) if is_would_block(err) => {
                    wait_ready(fd, Interest::WRITABLE, deadline)?;
                }
                Err(ref err) if is_interrupted(err) => {}
                Err(err) => return Err(Error::from_io(err)),
            }
        }
    }

    /// Sends one datagram per buffer to `dest`, batching through
    /// `sendmmsg(2)` where the OS has it.
    ///
    /// Buffers are consumed in order; a timeout part-way leaves the unsent
    /// suffix windows intact.
    pub fn send_to_many(
        &self,
        bufs: &mut [Buffer],
        dest: SocketAddrV4,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = deadline_of(timeout);
        let mut next = 0;
        while next < bufs.len() {
            let fd = self.io.raw()?;
            match self.send_batch(fd, &bufs[next..], &dest) {
                Ok(sent) if sent > 0 => {
                    for buf in &mut bufs[next..next + sent] {
                        let len = buf.len();
                        buf.advance(len);
                    }
                    next += sent;
                }
                Ok(_) => {}
                Err(ref err) if is_would_block(err) => {
                    wait_ready(fd, Interest::WRITABLE, deadline)?;
                }
                Err(ref err) if is_interrupted(err) => {}
                Err(err) => return Err(Error::from_io(err)),
            }
        }
        Ok(())
    }

    #[cfg(any(target_os = "android", target_os = "linux"))]
    fn send_batch(
        &self,
        fd: std::os::fd::RawFd,
        bufs: &[Buffer],
        dest: &SocketAddrV4,
    ) -> std::io::Result<usize> {
        let payloads: Vec<&[u8]> = bufs
            .iter()
            .take(sys::net::MMSG_BATCH)
            .map(|buf| buf.payload())
            .collect();
        sys::net::send_mmsg(fd, &payloads, dest)
    }

    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    fn send_batch(
        &self,
        fd: std::os::fd::RawFd,
        bufs: &[Buffer],
        dest: &SocketAddrV4,
    ) -> std::io::Result<usize> {
        match sys::net::send_to(fd, bufs[0].payload(), dest) {
            Ok(_) => Ok(1),
            Err(err) => Err(err),
        }
    }

    /// Receives one datagram into a fresh buffer, parking until something
    /// arrives or the timeout passes.
    pub fn recv_from(&self, timeout: Option<Duration>) -> Result<(Buffer, SocketAddrV4)> {
        let deadline = deadline_of(timeout);
        let mut buf = Buffer::with_capacity(UDP_RECV_BUF);
        loop {
            let fd = self.io.raw()?;
            match sys::net::recv_from(fd, buf.spare_mut()) {
                Ok((n, sender)) => {
                    trace!("received {} byte datagram from {}", n, sender);
                    buf.fill(n);
                    return Ok((buf, sender));
                }
                Err(ref err) if is_would_block(err) => {
                    wait_ready(fd, Interest::READABLE, deadline)?;
                }
                Err(ref err) if is_interrupted(err) => {}
                Err(err) => return Err(Error::from_io(err)),
            }
        }
    }

    /// Collects every datagram already queued, parking first if the queue
    /// is empty.
    ///
    /// The call parks until the first datagram (or the deadline, which
    /// reports [`Error::Timeout`]), then drains whatever else arrived and
    /// returns the batch with each sender's address. Uses `recvmmsg(2)`
    /// where the OS has it.
    pub fn recv_many(&self, timeout: Option<Duration>) -> Result<Vec<(Buffer, SocketAddrV4)>> {
        let deadline = deadline_of(timeout);
        let mut out = Vec::new();
        loop {
            let fd = self.io.raw()?;
            match self.recv_batch(fd) {
                Ok(batch) if !batch.is_empty() => {
                    out.extend(batch);
                }
                Ok(_) => {}
                Err(ref err) if is_would_block(err) => {
                    if !out.is_empty() {
                        return Ok(out);
                    }
                    wait_ready(fd, Interest::READABLE, deadline)?;
                }
                Err(ref err) if is_interrupted(err) => {}
                Err(err) => return Err(Error::from_io(err)),
            }
        }
    }

    #[cfg(any(target_os = "android", target_os = "linux"))]
    fn recv_batch(&self, fd: std::os::fd::RawFd) -> std::io::Result<Vec<(Buffer, SocketAddrV4)>> {
        let mut bufs: Vec<Buffer> = (0..sys::net::MMSG_BATCH)
            .map(|_| Buffer::with_capacity(UDP_RECV_BUF))
            .collect();
        let received = {
            let mut windows: Vec<&mut [u8]> = bufs.iter_mut().map(|buf| buf.spare_mut()).collect();
            sys::net::recv_mmsg(fd, &mut windows)?
        };
        trace!("received batch of {} datagrams", received.len());
        let mut out = Vec::with_capacity(received.len());
        for (buf, (n, sender)) in bufs.into_iter().zip(received) {
            let mut buf = buf;
            buf.fill(n);
            out.push((buf, sender));
        }
        Ok(out)
    }

    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    fn recv_batch(&self, fd: std::os::fd::RawFd) -> std::io::Result<Vec<(Buffer, SocketAddrV4)>> {
        let mut buf = Buffer::with_capacity(UDP_RECV_BUF);
        let (n, sender) = sys::net::recv_from(fd, buf.spare_mut())?;
        buf.fill(n);
        Ok(vec![(buf, sender)])
    }

    /// Closes the socket, aborting any task parked on it. Idempotent.
    pub fn close(&self) {
        self.io.close();
    }

    fn with_sock<T>(&self, f: impl FnOnce(SockRef<'_>) -> std::io::Result<T>) -> Result<T> {
        let guard = self.io.fd_guard();
        let fd = guard.as_ref().ok_or(Error::Closed)?;
        f(SockRef::from(fd)).map_err(Error::from_io)
    }
}
