//! Stable error taxonomy and OS error code translation
//!
//! Every fallible socket operation reports one of the kinds defined here;
//! raw OS error codes never cross the public surface. The mapping is done
//! per operation family because the same OS code means different things in
//! different calls (for example `WSAEWOULDBLOCK` is a pending connect on
//! Windows but a plain would-block on `recv`).

use std::io;

use crate::raw::Type;

/// Portable socket error kinds.
///
/// `InProgress` and `Later` are non-terminal: they tell the caller to wait
/// for the next readiness notification and retry. Everything else is a
/// terminal result for the operation that produced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SockError {
    /// A non-blocking `connect` was started and has not finished yet.
    #[error("connection attempt in progress")]
    InProgress,
    /// The operation would block; retry after the next readiness event.
    #[error("operation would block, try again later")]
    Later,
    /// The requested local address is not available on this host.
    #[error("address not available")]
    AddressNotAvailable,
    /// The requested local address is already in use.
    #[error("address in use")]
    AddressInUse,
    /// The operation was denied by the OS (for example a privileged port).
    #[error("access denied")]
    AccessDenied,
    /// The peer actively refused the connection. On datagram sockets this
    /// reports an asynchronous ICMP error for a previously sent packet.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The connection attempt timed out.
    #[error("connection timed out")]
    ConnectionTimedOut,
    /// Any OS error with no portable meaning.
    #[error("unknown network error")]
    Unknown,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn is_would_block(code: i32) -> bool {
            code == libc::EAGAIN || code == libc::EWOULDBLOCK
        }

        fn is_conn_reset(code: i32) -> bool {
            code == libc::ECONNRESET
        }

        fn is_conn_refused(code: i32) -> bool {
            code == libc::ECONNREFUSED
        }

        /// Maps the raw code of a failed `connect` call.
        pub(crate) fn map_connect_call(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(libc::EINPROGRESS) => SockError::InProgress,
                Some(libc::ECONNREFUSED) => SockError::ConnectionRefused,
                _ => SockError::Unknown,
            }
        }

        /// Maps the `SO_ERROR` value read after a pending connect completed.
        pub(crate) fn map_connect_result(code: i32) -> Result<(), SockError> {
            match code {
                0 => Ok(()),
                libc::ETIMEDOUT => Err(SockError::ConnectionTimedOut),
                libc::ECONNREFUSED => Err(SockError::ConnectionRefused),
                _ => Err(SockError::Unknown),
            }
        }

        pub(crate) fn map_bind(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(libc::EADDRNOTAVAIL) => SockError::AddressNotAvailable,
                Some(libc::EADDRINUSE) => SockError::AddressInUse,
                Some(libc::EACCES) => SockError::AccessDenied,
                _ => SockError::Unknown,
            }
        }

        pub(crate) fn map_listen(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(libc::EADDRINUSE) => SockError::AddressInUse,
                _ => SockError::Unknown,
            }
        }
    } else {
        use windows_sys::Win32::Networking::WinSock::{
            WSAEACCES, WSAEADDRINUSE, WSAEADDRNOTAVAIL, WSAECONNREFUSED, WSAECONNRESET,
            WSAETIMEDOUT, WSAEWOULDBLOCK,
        };

        fn is_would_block(code: i32) -> bool {
            code == WSAEWOULDBLOCK
        }

        fn is_conn_reset(code: i32) -> bool {
            code == WSAECONNRESET
        }

        fn is_conn_refused(code: i32) -> bool {
            code == WSAECONNREFUSED
        }

        /// Maps the raw code of a failed `connect` call.
        pub(crate) fn map_connect_call(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(WSAEWOULDBLOCK) => SockError::InProgress,
                Some(WSAECONNREFUSED) => SockError::ConnectionRefused,
                _ => SockError::Unknown,
            }
        }

        /// Maps the per-event error code delivered with `FD_CONNECT`.
        pub(crate) fn map_connect_result(code: i32) -> Result<(), SockError> {
            match code {
                0 => Ok(()),
                WSAETIMEDOUT => Err(SockError::ConnectionTimedOut),
                WSAECONNREFUSED => Err(SockError::ConnectionRefused),
                _ => Err(SockError::Unknown),
            }
        }

        pub(crate) fn map_bind(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(WSAEADDRNOTAVAIL) => SockError::AddressNotAvailable,
                Some(WSAEADDRINUSE) => SockError::AddressInUse,
                Some(WSAEACCES) => SockError::AccessDenied,
                _ => SockError::Unknown,
            }
        }

        pub(crate) fn map_listen(err: &io::Error) -> SockError {
            match err.raw_os_error() {
                Some(WSAEADDRINUSE) => SockError::AddressInUse,
                _ => SockError::Unknown,
            }
        }
    }
}

pub(crate) fn map_accept(err: &io::Error) -> SockError {
    match err.raw_os_error() {
        Some(code) if is_would_block(code) => SockError::Later,
        _ => SockError::Unknown,
    }
}

/// Maps a failed `send*` or `recv*` call.
///
/// An OS-reported "connection reset by peer" on a datagram socket is
/// remapped to `ConnectionRefused`: the usual cause is an ICMP unreachable
/// generated for an earlier datagram, not a stream teardown.
pub(crate) fn map_transfer(err: &io::Error, ty: Type) -> SockError {
    match err.raw_os_error() {
        Some(code) if is_would_block(code) => SockError::Later,
        Some(code) if is_conn_refused(code) => SockError::ConnectionRefused,
        Some(code) if is_conn_reset(code) => {
            if ty == Type::Dgram {
                SockError::ConnectionRefused
            } else {
                SockError::ConnectionReset
            }
        }
        _ => SockError::Unknown,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn os_err(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    #[test]
    fn test_would_block_maps_to_later() {
        assert_eq!(map_accept(&os_err(libc::EAGAIN)), SockError::Later);
        assert_eq!(
            map_transfer(&os_err(libc::EWOULDBLOCK), Type::Stream),
            SockError::Later
        );
    }

    #[test]
    fn test_dgram_reset_becomes_refused() {
        assert_eq!(
            map_transfer(&os_err(libc::ECONNRESET), Type::Dgram),
            SockError::ConnectionRefused
        );
        assert_eq!(
            map_transfer(&os_err(libc::ECONNRESET), Type::Stream),
            SockError::ConnectionReset
        );
    }

    #[test]
    fn test_connect_call_mapping() {
        assert_eq!(
            map_connect_call(&os_err(libc::EINPROGRESS)),
            SockError::InProgress
        );
        assert_eq!(
            map_connect_call(&os_err(libc::ECONNREFUSED)),
            SockError::ConnectionRefused
        );
        assert_eq!(map_connect_call(&os_err(libc::EPERM)), SockError::Unknown);
    }

    #[test]
    fn test_connect_result_mapping() {
        assert_eq!(map_connect_result(0), Ok(()));
        assert_eq!(
            map_connect_result(libc::ETIMEDOUT),
            Err(SockError::ConnectionTimedOut)
        );
        assert_eq!(
            map_connect_result(libc::ECONNREFUSED),
            Err(SockError::ConnectionRefused)
        );
        assert_eq!(map_connect_result(libc::EHOSTUNREACH), Err(SockError::Unknown));
    }

    #[test]
    fn test_bind_mapping() {
        assert_eq!(map_bind(&os_err(libc::EADDRINUSE)), SockError::AddressInUse);
        assert_eq!(
            map_bind(&os_err(libc::EADDRNOTAVAIL)),
            SockError::AddressNotAvailable
        );
        assert_eq!(map_bind(&os_err(libc::EACCES)), SockError::AccessDenied);
        assert_eq!(map_bind(&os_err(libc::EINVAL)), SockError::Unknown);
    }

    #[test]
    fn test_unknown_codes_collapse() {
        assert_eq!(map_listen(&os_err(libc::ENOTSOCK)), SockError::Unknown);
        assert_eq!(
            map_transfer(&os_err(libc::EFAULT), Type::Stream),
            SockError::Unknown
        );
    }
}
