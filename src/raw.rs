//! Low-level socket operations and platform abstractions
//!
//! This module wraps the handful of syscalls the crate needs behind a
//! unified interface: socket creation, non-blocking mode, the pktinfo and
//! reuse-address options, connection management, and plain data transfer.
//! Unix systems go through POSIX descriptors via `libc`; Windows goes
//! through WinSock2 via `windows-sys`, including the one-time `WSAStartup`
//! handshake.
//!
//! Errors are surfaced as `io::Error` carrying the raw OS code; callers in
//! `socket.rs` translate them into the portable taxonomy.

use std::io;

use crate::addr::SysAddr;

/// IP protocol domain for sockets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    /// IPv4 protocol
    Ipv4,
    /// IPv6 protocol
    Ipv6,
}

/// Socket type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    /// Connection-oriented stream socket (TCP)
    Stream,
    /// Datagram socket (UDP)
    Dgram,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::RawFd;

        /// Platform socket handle.
        pub type OsSocket = RawFd;

        /// One-time process-wide socket library setup. A no-op on POSIX;
        /// kept so callers are portable.
        pub fn global_init() -> io::Result<()> {
            Ok(())
        }

        /// Creates a new non-inheritable socket.
        pub(crate) fn socket(domain: Domain, ty: Type) -> io::Result<OsSocket> {
            let d = match domain {
                Domain::Ipv4 => libc::AF_INET,
                Domain::Ipv6 => libc::AF_INET6,
            };
            let t = match ty {
                Type::Stream => libc::SOCK_STREAM,
                Type::Dgram => libc::SOCK_DGRAM,
            };
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let t = t | libc::SOCK_CLOEXEC;
            let fd = unsafe { libc::socket(d, t, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(fd)
        }

        /// Puts the socket in non-blocking mode.
        pub(crate) fn set_nonblocking(fd: OsSocket) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        /// Requests per-packet destination info on a datagram socket.
        pub(crate) fn set_pktinfo(fd: OsSocket, domain: Domain) -> io::Result<()> {
            match domain {
                Domain::Ipv4 => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1),
                Domain::Ipv6 => setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1),
            }
        }

        /// Allows rebinding a recently used local address.
        pub(crate) fn set_reuse_addr(fd: OsSocket) -> io::Result<()> {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
        }

        fn setsockopt_int(fd: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    opt,
                    &v as *const _ as _,
                    std::mem::size_of::<libc::c_int>() as _,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn close_socket(fd: OsSocket) -> io::Result<()> {
            if unsafe { libc::close(fd) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn connect(fd: OsSocket, addr: &SysAddr) -> io::Result<()> {
            if unsafe { libc::connect(fd, addr.as_ptr(), addr.len) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn bind(fd: OsSocket, addr: &SysAddr) -> io::Result<()> {
            if unsafe { libc::bind(fd, addr.as_ptr(), addr.len) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn listen(fd: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { libc::listen(fd, backlog) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn accept(fd: OsSocket) -> io::Result<(OsSocket, SysAddr)> {
            let mut peer = SysAddr::zeroed();
            let new_fd = unsafe { libc::accept(fd, peer.as_mut_ptr(), &mut peer.len) };
            if new_fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((new_fd, peer))
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        pub(crate) const SEND_FLAGS: libc::c_int = 0;

        pub(crate) fn send(fd: OsSocket, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe { libc::send(fd, buf.as_ptr() as _, buf.len(), SEND_FLAGS) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn recv(fd: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as _, buf.len(), 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn send_to(fd: OsSocket, buf: &[u8], addr: &SysAddr) -> io::Result<usize> {
            let n = unsafe {
                libc::sendto(
                    fd,
                    buf.as_ptr() as _,
                    buf.len(),
                    SEND_FLAGS,
                    addr.as_ptr(),
                    addr.len,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn recv_from(fd: OsSocket, buf: &mut [u8]) -> io::Result<(usize, SysAddr)> {
            let mut peer = SysAddr::zeroed();
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as _,
                    buf.len(),
                    0,
                    peer.as_mut_ptr(),
                    &mut peer.len,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((n as usize, peer))
        }

        /// Reads and clears the pending socket error, as left behind by a
        /// finished non-blocking connect.
        pub(crate) fn take_so_error(fd: OsSocket) -> io::Result<i32> {
            let mut val: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut val as *mut _ as _,
                    &mut len,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(val)
        }

        pub(crate) fn local_name(fd: OsSocket) -> io::Result<SysAddr> {
            let mut addr = SysAddr::zeroed();
            if unsafe { libc::getsockname(fd, addr.as_mut_ptr(), &mut addr.len) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(addr)
        }

        pub(crate) fn peer_name(fd: OsSocket) -> io::Result<SysAddr> {
            let mut addr = SysAddr::zeroed();
            if unsafe { libc::getpeername(fd, addr.as_mut_ptr(), &mut addr.len) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(addr)
        }
    } else {
        // Windows
        use std::os::windows::io::RawSocket;
        use std::sync::OnceLock;

        use windows_sys::Win32::Networking::WinSock::{
            self as ws, FIONBIO, INVALID_SOCKET, IPPROTO_IP, IPPROTO_IPV6, IPV6_PKTINFO,
            IP_PKTINFO, SOCKET_ERROR, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
            SO_REUSEADDR, WSADATA, WSAEVENT, WSANETWORKEVENTS, WSA_FLAG_OVERLAPPED,
        };

        /// Platform socket handle.
        pub type OsSocket = RawSocket;

        static WSA_INIT: OnceLock<Result<(), i32>> = OnceLock::new();

        /// One-time process-wide WinSock setup. Requests version 2.2 and
        /// verifies the negotiated version; idempotent and safe to call
        /// from multiple places.
        pub fn global_init() -> io::Result<()> {
            let res = WSA_INIT.get_or_init(|| {
                let requested: u16 = 0x0202; // MAKEWORD(2, 2)
                let mut data: WSADATA = unsafe { std::mem::zeroed() };
                let rc = unsafe { ws::WSAStartup(requested, &mut data) };
                if rc != 0 {
                    return Err(rc);
                }
                if data.wVersion != requested {
                    unsafe { ws::WSACleanup() };
                    return Err(ws::WSAVERNOTSUPPORTED);
                }
                Ok(())
            });
            res.map_err(io::Error::from_raw_os_error)
        }

        pub(crate) fn last_error() -> io::Error {
            io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() })
        }

        /// Creates a new overlapped-capable socket.
        pub(crate) fn socket(domain: Domain, ty: Type) -> io::Result<OsSocket> {
            global_init()?;
            let d = match domain {
                Domain::Ipv4 => ws::AF_INET,
                Domain::Ipv6 => ws::AF_INET6,
            } as i32;
            let t = match ty {
                Type::Stream => SOCK_STREAM,
                Type::Dgram => SOCK_DGRAM,
            } as i32;
            let s = unsafe { ws::WSASocketW(d, t, 0, std::ptr::null(), 0, WSA_FLAG_OVERLAPPED) };
            if s == INVALID_SOCKET {
                return Err(last_error());
            }
            Ok(s as OsSocket)
        }

        /// Puts the socket in non-blocking mode.
        pub(crate) fn set_nonblocking(s: OsSocket) -> io::Result<()> {
            let mut nb: u32 = 1;
            if unsafe { ws::ioctlsocket(s as usize, FIONBIO, &mut nb) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        /// Requests per-packet destination info on a datagram socket.
        pub(crate) fn set_pktinfo(s: OsSocket, domain: Domain) -> io::Result<()> {
            match domain {
                Domain::Ipv4 => setsockopt_int(s, IPPROTO_IP, IP_PKTINFO as i32, 1),
                Domain::Ipv6 => setsockopt_int(s, IPPROTO_IPV6, IPV6_PKTINFO as i32, 1),
            }
        }

        /// Allows rebinding a recently used local address.
        pub(crate) fn set_reuse_addr(s: OsSocket) -> io::Result<()> {
            setsockopt_int(s, SOL_SOCKET as i32, SO_REUSEADDR as i32, 1)
        }

        fn setsockopt_int(s: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let rc = unsafe {
                ws::setsockopt(
                    s as usize,
                    level,
                    opt,
                    &val as *const _ as _,
                    std::mem::size_of::<i32>() as i32,
                )
            };
            if rc != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub(crate) fn close_socket(s: OsSocket) -> io::Result<()> {
            if unsafe { ws::closesocket(s as usize) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub(crate) fn connect(s: OsSocket, addr: &SysAddr) -> io::Result<()> {
            if unsafe { ws::connect(s as usize, addr.as_ptr(), addr.len) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub(crate) fn bind(s: OsSocket, addr: &SysAddr) -> io::Result<()> {
            if unsafe { ws::bind(s as usize, addr.as_ptr(), addr.len) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub(crate) fn listen(s: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { ws::listen(s as usize, backlog) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        pub(crate) fn accept(s: OsSocket) -> io::Result<(OsSocket, SysAddr)> {
            let mut peer = SysAddr::zeroed();
            let new_s = unsafe { ws::accept(s as usize, peer.as_mut_ptr(), &mut peer.len) };
            if new_s == INVALID_SOCKET {
                return Err(last_error());
            }
            Ok((new_s as OsSocket, peer))
        }

        pub(crate) fn send(s: OsSocket, buf: &[u8]) -> io::Result<usize> {
            let n = unsafe { ws::send(s as usize, buf.as_ptr(), buf.len() as i32, 0) };
            if n == SOCKET_ERROR {
                return Err(last_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn recv(s: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe { ws::recv(s as usize, buf.as_mut_ptr(), buf.len() as i32, 0) };
            if n == SOCKET_ERROR {
                return Err(last_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn send_to(s: OsSocket, buf: &[u8], addr: &SysAddr) -> io::Result<usize> {
            let n = unsafe {
                ws::sendto(
                    s as usize,
                    buf.as_ptr(),
                    buf.len() as i32,
                    0,
                    addr.as_ptr(),
                    addr.len,
                )
            };
            if n == SOCKET_ERROR {
                return Err(last_error());
            }
            Ok(n as usize)
        }

        pub(crate) fn recv_from(s: OsSocket, buf: &mut [u8]) -> io::Result<(usize, SysAddr)> {
            let mut peer = SysAddr::zeroed();
            let n = unsafe {
                ws::recvfrom(
                    s as usize,
                    buf.as_mut_ptr(),
                    buf.len() as i32,
                    0,
                    peer.as_mut_ptr(),
                    &mut peer.len,
                )
            };
            if n == SOCKET_ERROR {
                return Err(last_error());
            }
            Ok((n as usize, peer))
        }

        /// Reads and clears the pending socket error.
        pub(crate) fn take_so_error(s: OsSocket) -> io::Result<i32> {
            let mut val: i32 = 0;
            let mut len = std::mem::size_of::<i32>() as i32;
            let rc = unsafe {
                ws::getsockopt(
                    s as usize,
                    SOL_SOCKET as i32,
                    SO_ERROR as i32,
                    &mut val as *mut _ as _,
                    &mut len,
                )
            };
            if rc != 0 {
                return Err(last_error());
            }
            Ok(val)
        }

        pub(crate) fn local_name(s: OsSocket) -> io::Result<SysAddr> {
            let mut addr = SysAddr::zeroed();
            if unsafe { ws::getsockname(s as usize, addr.as_mut_ptr(), &mut addr.len) } != 0 {
                return Err(last_error());
            }
            Ok(addr)
        }

        pub(crate) fn peer_name(s: OsSocket) -> io::Result<SysAddr> {
            let mut addr = SysAddr::zeroed();
            if unsafe { ws::getpeername(s as usize, addr.as_mut_ptr(), &mut addr.len) } != 0 {
                return Err(last_error());
            }
            Ok(addr)
        }

        /// Creates a WSA event object for `WSAEventSelect` notification.
        pub(crate) fn wsa_create_event() -> io::Result<WSAEVENT> {
            let ev = unsafe { ws::WSACreateEvent() };
            if ev == 0 {
                return Err(last_error());
            }
            Ok(ev)
        }

        pub(crate) fn wsa_close_event(ev: WSAEVENT) {
            unsafe { ws::WSACloseEvent(ev) };
        }

        /// Selects which FD_* conditions signal the event object.
        pub(crate) fn wsa_event_select(s: OsSocket, ev: WSAEVENT, mask: i32) -> io::Result<()> {
            if unsafe { ws::WSAEventSelect(s as usize, ev, mask) } != 0 {
                return Err(last_error());
            }
            Ok(())
        }

        /// Retrieves and resets the network events recorded on the object.
        pub(crate) fn wsa_enum_events(s: OsSocket, ev: WSAEVENT) -> io::Result<WSANETWORKEVENTS> {
            let mut out: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
            if unsafe { ws::WSAEnumNetworkEvents(s as usize, ev, &mut out) } != 0 {
                return Err(last_error());
            }
            Ok(out)
        }
    }
}
