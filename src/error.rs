use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The one flat error set the runtime reports.
///
/// The socket adapter absorbs `EAGAIN`/`EWOULDBLOCK`, `EINTR` and
/// `EINPROGRESS` internally; everything else is surfaced as one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller misuse, e.g. parking outside a task or joining from outside
    /// the owning loop's thread.
    #[error("invalid parameter or calling context")]
    InvalidParam,

    /// The OS ran out of memory, descriptors or polling capacity.
    #[error("out of OS resources")]
    NoResources,

    /// An unclassified syscall failure.
    #[error("network error: {0}")]
    NetworkError(io::Error),

    #[error("address already in use")]
    AddressInUse,

    #[error("connection refused by peer")]
    ConnectionRefused,

    #[error("host or network unreachable")]
    HostUnreachable,

    /// The peer closed the connection, or the local socket was closed under
    /// the caller's feet.
    #[error("connection closed")]
    Closed,

    /// The deadline passed before readiness or completion.
    #[error("operation timed out")]
    Timeout,

    /// Only reported by explicitly nonblocking helpers, never by the
    /// blocking adapter API.
    #[error("operation would block")]
    WouldBlock,

    /// The wait was interrupted by socket destruction.
    #[error("operation aborted")]
    Aborted,
}

impl Error {
    /// Maps an OS error to the flat set.
    pub(crate) fn from_io(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EADDRINUSE) => Error::AddressInUse,
            Some(libc::ECONNREFUSED) => Error::ConnectionRefused,
            Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => Error::HostUnreachable,
            Some(libc::ECONNRESET) | Some(libc::EPIPE) | Some(libc::ENOTCONN) => Error::Closed,
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) | Some(libc::EMFILE)
            | Some(libc::ENFILE) => Error::NoResources,
            _ => Error::NetworkError(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::io;

    #[test]
    fn os_errors_map_to_flat_kinds() {
        let refused = Error::from_io(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert!(matches!(refused, Error::ConnectionRefused));

        let in_use = Error::from_io(io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(matches!(in_use, Error::AddressInUse));

        let unreachable = Error::from_io(io::Error::from_raw_os_error(libc::ENETUNREACH));
        assert!(matches!(unreachable, Error::HostUnreachable));

        let exhausted = Error::from_io(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(exhausted, Error::NoResources));

        let other = Error::from_io(io::Error::from_raw_os_error(libc::EPROTO));
        assert!(matches!(other, Error::NetworkError(_)));
    }
}
