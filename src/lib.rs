//! # evsock - Reactor-Driven Non-Blocking Sockets
//!
//! evsock is a portable non-blocking socket abstraction integrated with a
//! single-threaded reactor-style event loop. It presents one contract over
//! two divergent OS event models: readiness-based file descriptors on
//! POSIX systems (epoll/kqueue via `mio`) and network-event objects on
//! Windows (`WSAEventSelect` via `windows-sys`).
//!
//! ## Key Features
//!
//! - **Uniform event contract**: logical `Read`/`Write`/`Accept`/`Connect`
//!   events with per-event or global handlers, dispatched in a fixed order
//! - **Asynchronous connect**: three-state connect machine with a portable
//!   result taxonomy (`get_connect_result` after the `Connect` event)
//! - **Datagram source/destination control**: `send_to_from` and
//!   `recv_from_to` carry per-packet `IP_PKTINFO`/`IPV6_PKTINFO` ancillary
//!   data, with graceful fallback where unsupported
//! - **Re-entrancy safe dispatch**: handlers may close their own socket;
//!   the dispatcher detects it and stops cleanly
//! - **Starvation avoidance**: a per-notification receive quota keeps one
//!   busy socket from monopolizing the loop
//! - **Stable errors**: heterogeneous OS codes collapse into one portable
//!   error taxonomy; raw codes never leak
//!
//! ## Quick Example
//!
//! A UDP responder that replies from the exact address each request was
//! sent to — the multihomed-server problem `recv_from_to`/`send_to_from`
//! exist for:
//!
//! ```rust,no_run
//! use evsock::{Domain, Event, Reactor, Socket, Type};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reactor = Reactor::new()?;
//!     let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram)?;
//!     socket.bind("0.0.0.0:5353".parse()?)?;
//!
//!     let responder = socket.clone();
//!     socket.install_event_handler(Event::Read, move |_| {
//!         let mut buf = [0u8; 2048];
//!         loop {
//!             match responder.recv_from_to(&mut buf) {
//!                 Ok((len, peer, local_ip)) => {
//!                     // Answer from the address the request targeted.
//!                     let _ = responder.send_to_from(&buf[..len], peer, local_ip);
//!                 }
//!                 Err(_) => break,
//!             }
//!         }
//!     });
//!     socket.enable_event(Event::Read);
//!
//!     reactor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`reactor`]: the event loop backend (mio readiness on POSIX, WSA
//!   event objects on Windows), selected per target OS
//! - [`socket`]: the socket object, handler table, and dispatcher
//! - [`event`]: logical events, event sets, and their compatibility rules
//! - [`error`]: the portable error taxonomy and OS code translation
//! - [`config`]: per-socket configuration applied at open time
//! - `addr`: conversion between `SocketAddr` and OS sockaddr storage
//! - `pktinfo`: ancillary-message build/parse for per-packet
//!   source/destination IPs
//! - [`raw`]: the thin syscall layer underneath everything
//!
//! ## Concurrency Model
//!
//! Single-threaded cooperative. All socket operations and all handler
//! invocations run on the reactor's thread; no API blocks. Types are
//! deliberately not `Send`.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

/// Conversion between portable and OS socket addresses
pub(crate) mod addr;
/// Per-socket configuration
pub mod config;
/// Portable error taxonomy
pub mod error;
/// Logical events and event sets
pub mod event;
/// Ancillary-message handling for per-packet source/destination IPs
pub(crate) mod pktinfo;
/// Low-level socket operations and platform abstractions
pub mod raw;
/// The reactor-integrated socket object
pub mod socket;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Reactor backend: mio-based fd readiness (epoll/kqueue)
        pub mod reactor { pub use crate::reactor_unix::*; }
        mod reactor_unix;
    } else {
        /// Reactor backend: WSA event objects
        pub mod reactor { pub use crate::reactor_windows::*; }
        mod reactor_windows;
    }
}

pub use config::SocketConfig;
pub use error::SockError;
pub use event::{Event, EventSet};
pub use raw::{global_init, Domain, Type};
pub use reactor::Reactor;
pub use socket::Socket;
