use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

pub(crate) fn to_sockaddr(addr: &SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    // SAFETY: all-zeroes is a valid `sockaddr_in` (this also covers the
    // BSD-only `sin_len` field and `sin_zero` padding).
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    (raw, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

/// `storage` must hold a `sockaddr_in` written by the OS.
pub(crate) unsafe fn from_sockaddr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddrV4> {
    if (*storage).ss_family as libc::c_int != libc::AF_INET {
        return Err(io::ErrorKind::InvalidInput.into());
    }
    let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
    Ok(SocketAddrV4::new(
        Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(addr.sin_port),
    ))
}

/// Accepts one pending connection as a nonblocking, close-on-exec fd.
pub(crate) fn accept(listener: RawFd) -> io::Result<(OwnedFd, SocketAddrV4)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    let fd = syscall!(accept4(
        listener,
        storage.as_mut_ptr().cast(),
        &mut length,
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    ))?;

    // Platforms without `accept4(2)`: set the flags with two extra calls.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let fd = {
        let fd = syscall!(accept(listener, storage.as_mut_ptr().cast(), &mut length))?;
        match syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
            .and_then(|_| syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)))
        {
            Ok(_) => fd,
            Err(err) => {
                let _ = syscall!(close(fd));
                return Err(err);
            }
        }
    };

    // SAFETY: `accept(2)` ensures the fd is valid.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: the OS initialised `storage` with the peer address.
    let peer = unsafe { from_sockaddr(storage.as_ptr()) }?;
    Ok((fd, peer))
}

/// Local address of a bound socket.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(fd, storage.as_mut_ptr().cast(), &mut length))?;
    // SAFETY: `getsockname(2)` initialised `storage`.
    unsafe { from_sockaddr(storage.as_ptr()) }
}

/// Peer address of a connected socket.
pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(fd, storage.as_mut_ptr().cast(), &mut length))?;
    // SAFETY: `getpeername(2)` initialised `storage`.
    unsafe { from_sockaddr(storage.as_ptr()) }
}

/// Reads and clears `SO_ERROR`; the verdict of a nonblocking connect.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&mut value as *mut libc::c_int).cast(),
        &mut length,
    ))?;
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

pub(crate) fn shutdown_both(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_RDWR)).map(|_| ())
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr().cast(), buf.len())).map(|n| n as usize)
}

/// Gather-write of every slice in one `writev(2)`.
pub(crate) fn send_vectored(fd: RawFd, slices: &[io::IoSlice<'_>]) -> io::Result<usize> {
    // `IoSlice` is guaranteed ABI-compatible with `iovec`.
    syscall!(writev(
        fd,
        slices.as_ptr().cast::<libc::iovec>(),
        slices.len().min(libc::c_int::MAX as usize) as libc::c_int,
    ))
    .map(|n| n as usize)
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], dest: &SocketAddrV4) -> io::Result<usize> {
    let (raw, length) = to_sockaddr(dest);
    syscall!(sendto(
        fd,
        buf.as_ptr().cast(),
        buf.len(),
        0,
        (&raw as *const libc::sockaddr_in).cast(),
        length,
    ))
    .map(|n| n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr().cast(),
        buf.len(),
        0,
        storage.as_mut_ptr().cast(),
        &mut length,
    ))?;
    // SAFETY: `recvfrom(2)` initialised `storage` with the sender.
    let sender = unsafe { from_sockaddr(storage.as_ptr()) }?;
    Ok((n as usize, sender))
}

/// How many datagrams one batched UDP call moves at most.
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) const MMSG_BATCH: usize = 16;

/// Sends up to [`MMSG_BATCH`] datagrams to one destination in a single
/// `sendmmsg(2)`; returns how many were accepted.
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) fn send_mmsg(fd: RawFd, payloads: &[&[u8]], dest: &SocketAddrV4) -> io::Result<usize> {
    let (raw, length) = to_sockaddr(dest);
    let count = payloads.len().min(MMSG_BATCH);
    // SAFETY: all-zeroes is valid for both arrays; every header the call
    // reads is initialised in the loop below.
    let mut iovecs: [libc::iovec; MMSG_BATCH] = unsafe { mem::zeroed() };
    let mut headers: [libc::mmsghdr; MMSG_BATCH] = unsafe { mem::zeroed() };
    for i in 0..count {
        iovecs[i] = libc::iovec {
            iov_base: payloads[i].as_ptr() as *mut libc::c_void,
            iov_len: payloads[i].len(),
        };
        // One shared destination; `sendmmsg` only reads the name.
        headers[i].msg_hdr.msg_name = (&raw as *const libc::sockaddr_in) as *mut libc::c_void;
        headers[i].msg_hdr.msg_namelen = length;
        headers[i].msg_hdr.msg_iov = &mut iovecs[i];
        headers[i].msg_hdr.msg_iovlen = 1;
    }
    syscall!(sendmmsg(fd, headers.as_mut_ptr(), count as libc::c_uint, 0)).map(|n| n as usize)
}

/// Receives up to [`MMSG_BATCH`] datagrams in a single `recvmmsg(2)`;
/// returns `(bytes, sender)` per datagram in arrival order.
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) fn recv_mmsg(
    fd: RawFd,
    bufs: &mut [&mut [u8]],
) -> io::Result<Vec<(usize, SocketAddrV4)>> {
    let count = bufs.len().min(MMSG_BATCH);
    // SAFETY: all-zeroes is valid for these arrays; the kernel fills the
    // address storage per received datagram.
    let mut storage: [libc::sockaddr_storage; MMSG_BATCH] = unsafe { mem::zeroed() };
    let mut iovecs: [libc::iovec; MMSG_BATCH] = unsafe { mem::zeroed() };
    let mut headers: [libc::mmsghdr; MMSG_BATCH] = unsafe { mem::zeroed() };
    for i in 0..count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_mut_ptr().cast(),
            iov_len: bufs[i].len(),
        };
        headers[i].msg_hdr.msg_name = (&mut storage[i] as *mut libc::sockaddr_storage).cast();
        headers[i].msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        headers[i].msg_hdr.msg_iov = &mut iovecs[i];
        headers[i].msg_hdr.msg_iovlen = 1;
    }
    let received = syscall!(recvmmsg(
        fd,
        headers.as_mut_ptr(),
        count as libc::c_uint,
        0,
        std::ptr::null_mut(),
    ))? as usize;

    let mut out = Vec::with_capacity(received);
    for i in 0..received {
        // SAFETY: the kernel wrote the sender for each received datagram.
        let sender = unsafe { from_sockaddr(&storage[i]) }?;
        out.push((headers[i].msg_len as usize, sender));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{from_sockaddr, to_sockaddr};
    use std::mem::MaybeUninit;
    use std::net::SocketAddrV4;

    #[test]
    fn sockaddr_round_trip() {
        let addr: SocketAddrV4 = "192.168.17.4:44818".parse().unwrap();
        let (raw, _len) = to_sockaddr(&addr);

        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        // SAFETY: `sockaddr_in` is a prefix of `sockaddr_storage`.
        let back = unsafe {
            storage.as_mut_ptr().cast::<libc::sockaddr_in>().write(raw);
            from_sockaddr(storage.as_ptr()).unwrap()
        };
        assert_eq!(back, addr);
    }

    #[test]
    fn dotted_quad_round_trip() {
        for text in ["0.0.0.0:0", "127.0.0.1:2222", "255.255.255.255:65535"] {
            let addr: SocketAddrV4 = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn rejects_non_inet_families() {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        // SAFETY: zeroed storage is a valid (if nonsense) sockaddr; the
        // family field decides the outcome.
        let result = unsafe {
            (*storage.as_mut_ptr()).ss_family = libc::AF_UNIX as libc::sa_family_t;
            from_sockaddr(storage.as_ptr())
        };
        assert!(result.is_err());
    }
}
