//! Conversion between portable socket addresses and OS sockaddr storage
//!
//! The crate converses in [`std::net::SocketAddr`] and converts at the
//! syscall boundary. IPv6 flow information and scope ids are normalized to
//! zero on the way out (scoped addresses are not supported) and reported as
//! zero on the way in. Address families other than `AF_INET`/`AF_INET6`
//! are rejected.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::SockError;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// OS socket address: generic storage plus the valid length.
        pub(crate) struct SysAddr {
            pub storage: libc::sockaddr_storage,
            pub len: libc::socklen_t,
        }

        impl SysAddr {
            /// Storage sized for any supported family, for address-returning
            /// syscalls to fill in.
            pub(crate) fn zeroed() -> Self {
                SysAddr {
                    storage: unsafe { mem::zeroed() },
                    len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
                }
            }

            pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
                &self.storage as *const _ as *const libc::sockaddr
            }

            pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
                &mut self.storage as *mut _ as *mut libc::sockaddr
            }
        }

        /// Converts a portable address into OS sockaddr storage.
        pub(crate) fn to_sockaddr(addr: SocketAddr) -> SysAddr {
            let mut out = SysAddr::zeroed();
            match addr {
                SocketAddr::V4(a) => {
                    let sin = libc::sockaddr_in {
                        sin_family: libc::AF_INET as _,
                        sin_port: a.port().to_be(),
                        sin_addr: libc::in_addr {
                            s_addr: u32::from(*a.ip()).to_be(),
                        },
                        ..unsafe { mem::zeroed() }
                    };
                    unsafe {
                        *(&mut out.storage as *mut _ as *mut libc::sockaddr_in) = sin;
                    }
                    out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                }
                SocketAddr::V6(a) => {
                    // flowinfo and scope_id deliberately left zero
                    let sin6 = libc::sockaddr_in6 {
                        sin6_family: libc::AF_INET6 as _,
                        sin6_port: a.port().to_be(),
                        sin6_addr: libc::in6_addr {
                            s6_addr: a.ip().octets(),
                        },
                        ..unsafe { mem::zeroed() }
                    };
                    unsafe {
                        *(&mut out.storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
                    }
                    out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
                }
            }
            out
        }

        /// Converts filled OS sockaddr storage back into a portable address.
        pub(crate) fn from_sockaddr(sys: &SysAddr) -> Result<SocketAddr, SockError> {
            match i32::from(sys.storage.ss_family) {
                libc::AF_INET => {
                    debug_assert!(sys.len as usize >= mem::size_of::<libc::sockaddr_in>());
                    let sin = unsafe { &*(&sys.storage as *const _ as *const libc::sockaddr_in) };
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
                }
                libc::AF_INET6 => {
                    debug_assert!(sys.len as usize >= mem::size_of::<libc::sockaddr_in6>());
                    let sin6 = unsafe { &*(&sys.storage as *const _ as *const libc::sockaddr_in6) };
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    Ok(SocketAddr::V6(SocketAddrV6::new(
                        ip,
                        u16::from_be(sin6.sin6_port),
                        0,
                        0,
                    )))
                }
                _ => Err(SockError::Unknown),
            }
        }
    } else {
        use windows_sys::Win32::Networking::WinSock::{
            AF_INET, AF_INET6, IN6_ADDR, IN6_ADDR_0, IN_ADDR, IN_ADDR_0, SOCKADDR,
            SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE,
        };

        /// OS socket address: generic storage plus the valid length.
        pub(crate) struct SysAddr {
            pub storage: SOCKADDR_STORAGE,
            pub len: i32,
        }

        impl SysAddr {
            /// Storage sized for any supported family, for address-returning
            /// syscalls to fill in.
            pub(crate) fn zeroed() -> Self {
                SysAddr {
                    storage: unsafe { mem::zeroed() },
                    len: mem::size_of::<SOCKADDR_STORAGE>() as i32,
                }
            }

            pub(crate) fn as_ptr(&self) -> *const SOCKADDR {
                &self.storage as *const _ as *const SOCKADDR
            }

            pub(crate) fn as_mut_ptr(&mut self) -> *mut SOCKADDR {
                &mut self.storage as *mut _ as *mut SOCKADDR
            }
        }

        /// Converts a portable address into OS sockaddr storage.
        pub(crate) fn to_sockaddr(addr: SocketAddr) -> SysAddr {
            let mut out = SysAddr::zeroed();
            match addr {
                SocketAddr::V4(a) => {
                    let mut sin: SOCKADDR_IN = unsafe { mem::zeroed() };
                    sin.sin_family = AF_INET;
                    sin.sin_port = a.port().to_be();
                    sin.sin_addr = IN_ADDR {
                        S_un: IN_ADDR_0 {
                            S_addr: u32::from(*a.ip()).to_be(),
                        },
                    };
                    unsafe {
                        *(&mut out.storage as *mut _ as *mut SOCKADDR_IN) = sin;
                    }
                    out.len = mem::size_of::<SOCKADDR_IN>() as i32;
                }
                SocketAddr::V6(a) => {
                    // flowinfo and scope_id deliberately left zero
                    let mut sin6: SOCKADDR_IN6 = unsafe { mem::zeroed() };
                    sin6.sin6_family = AF_INET6;
                    sin6.sin6_port = a.port().to_be();
                    sin6.sin6_addr = IN6_ADDR {
                        u: IN6_ADDR_0 {
                            Byte: a.ip().octets(),
                        },
                    };
                    unsafe {
                        *(&mut out.storage as *mut _ as *mut SOCKADDR_IN6) = sin6;
                    }
                    out.len = mem::size_of::<SOCKADDR_IN6>() as i32;
                }
            }
            out
        }

        /// Converts filled OS sockaddr storage back into a portable address.
        pub(crate) fn from_sockaddr(sys: &SysAddr) -> Result<SocketAddr, SockError> {
            match sys.storage.ss_family {
                AF_INET => {
                    debug_assert!(sys.len as usize >= mem::size_of::<SOCKADDR_IN>());
                    let sin = unsafe { &*(&sys.storage as *const _ as *const SOCKADDR_IN) };
                    let ip = Ipv4Addr::from(u32::from_be(unsafe { sin.sin_addr.S_un.S_addr }));
                    Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
                }
                AF_INET6 => {
                    debug_assert!(sys.len as usize >= mem::size_of::<SOCKADDR_IN6>());
                    let sin6 = unsafe { &*(&sys.storage as *const _ as *const SOCKADDR_IN6) };
                    let ip = Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte });
                    Ok(SocketAddr::V6(SocketAddrV6::new(
                        ip,
                        u16::from_be(sin6.sin6_port),
                        0,
                        0,
                    )))
                }
                _ => Err(SockError::Unknown),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let addr: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let sys = to_sockaddr(addr);
        assert_eq!(sys.len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(from_sockaddr(&sys).unwrap(), addr);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let addr: SocketAddr = "[2001:db8::2:1]:53".parse().unwrap();
        let sys = to_sockaddr(addr);
        assert_eq!(sys.len as usize, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(from_sockaddr(&sys).unwrap(), addr);
    }

    #[test]
    fn test_ipv6_scope_and_flowinfo_normalized() {
        let addr = SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1),
            9000,
            0x1234,
            7,
        ));
        let sys = to_sockaddr(addr);
        let sin6 = unsafe { &*(&sys.storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(sin6.sin6_flowinfo, 0);
        assert_eq!(sin6.sin6_scope_id, 0);
        let back = from_sockaddr(&sys).unwrap();
        match back {
            SocketAddr::V6(v6) => {
                assert_eq!(*v6.ip(), Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
                assert_eq!(v6.port(), 9000);
                assert_eq!(v6.flowinfo(), 0);
                assert_eq!(v6.scope_id(), 0);
            }
            _ => panic!("expected v6"),
        }
    }

    #[test]
    fn test_foreign_family_rejected() {
        let mut sys = SysAddr::zeroed();
        sys.storage.ss_family = libc::AF_UNIX as _;
        assert_eq!(from_sockaddr(&sys), Err(SockError::Unknown));
    }
}
