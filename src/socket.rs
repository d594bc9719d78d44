//! Reactor-integrated non-blocking socket
//!
//! [`Socket`] owns an OS socket, its reactor registration, and a table of
//! event handlers. Every operation is non-blocking and returns promptly;
//! progress between calls happens only when the owning reactor dispatches
//! readiness to the socket. All use must stay on the reactor's thread.
//!
//! # Events and handlers
//!
//! A socket waits on logical events — `Read`, `Write`, `Accept`,
//! `Connect` — with either one handler per event or a single global
//! handler that receives the whole returned set; the two modes are
//! mutually exclusive. Per-event handlers run in the fixed order Read,
//! Write, Accept, Connect. `Read`/`Write` cannot be waited on together
//! with `Accept` or `Connect` (they describe different lifecycle phases).
//!
//! A handler may call anything on its socket, including [`Socket::close`].
//! The dispatcher watches a per-socket liveness token and stops touching
//! the socket the moment a handler destroys it, so no further handlers run
//! for that notification.
//!
//! # Connecting
//!
//! Non-blocking `connect` that cannot finish immediately returns
//! [`SockError::InProgress`]; enable the `Connect` event and call
//! [`Socket::get_connect_result`] from its handler once it fires.
//!
//! # Receive quota
//!
//! [`Socket::set_recv_max`] caps how many receive calls are served per
//! readiness notification; once the quota is spent receives report
//! [`SockError::Later`] without touching the OS, forcing the handler to
//! yield. The reactor redelivers the remaining readiness on its next
//! cycle.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::addr;
use crate::config::SocketConfig;
use crate::error::{self, SockError};
use crate::event::{self, Event, EventSet};
use crate::pktinfo;
use crate::raw::{self, Domain, OsSocket, Type};
use crate::reactor::Reactor;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, RawFd};

        use crate::reactor::{FdToken, Ready};

        type BackendToken = FdToken;
    } else {
        use std::os::windows::io::{AsRawSocket, RawSocket};

        use windows_sys::Win32::Networking::WinSock::{
            FD_ACCEPT, FD_CLOSE, FD_CONNECT, FD_CONNECT_BIT, FD_READ, FD_WRITE, WSAEVENT,
        };

        use crate::reactor::HandleToken;

        type BackendToken = HandleToken;
    }
}

/// Progress of a non-blocking connection attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnectState {
    Idle,
    InProgress,
    Completed,
}

type Handler = Rc<RefCell<dyn FnMut(EventSet)>>;

#[derive(Default)]
struct HandlerTable {
    global: Option<Handler>,
    per: [Option<Handler>; 4],
}

impl HandlerTable {
    fn clear(&mut self) {
        self.global = None;
        self.per = Default::default();
    }
}

struct SocketInner {
    reactor: Reactor,
    os: OsSocket,
    #[cfg(windows)]
    event: WSAEVENT,
    ty: Type,
    have_pktinfo: bool,
    cfg: SocketConfig,
    token: Cell<Option<BackendToken>>,
    wait_events: Cell<EventSet>,
    handlers: RefCell<HandlerTable>,
    connect_state: Cell<ConnectState>,
    connect_result: Cell<Result<(), SockError>>,
    last_error: Cell<Option<SockError>>,
    recv_max: Cell<i32>,
    recv_num: Cell<i32>,
    /// Liveness token: cleared by `close`, observed by the dispatcher to
    /// detect in-handler destruction.
    alive: Rc<Cell<bool>>,
}

/// A non-blocking socket driven by a [`Reactor`].
///
/// `Socket` is a shared handle; clones refer to the same underlying
/// socket, which is what lets event handlers capture one and operate on
/// their own socket. The OS handle and the reactor registration are
/// released by [`Socket::close`] — call it explicitly once the socket is
/// done, since a handler that captures its own socket keeps the socket
/// alive until `close` clears the handler table. A socket with no
/// installed handlers is also released when its last handle is dropped.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<SocketInner>,
}

impl Socket {
    /// Opens a socket with the default [`SocketConfig`].
    pub fn open(reactor: &Reactor, domain: Domain, ty: Type) -> Result<Self, SockError> {
        Self::open_with(reactor, domain, ty, &SocketConfig::default())
    }

    /// Opens a socket: creates the OS socket, puts it in non-blocking
    /// mode, requests per-packet destination info for datagram sockets
    /// (best-effort), and registers with the reactor.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.recv_max` is neither positive nor `-1`.
    pub fn open_with(
        reactor: &Reactor,
        domain: Domain,
        ty: Type,
        cfg: &SocketConfig,
    ) -> Result<Self, SockError> {
        assert!(
            cfg.recv_max > 0 || cfg.recv_max == -1,
            "recv_max must be positive or -1"
        );
        if raw::global_init().is_err() {
            return Err(SockError::Unknown);
        }
        let os = match raw::socket(domain, ty) {
            Ok(os) => os,
            Err(err) => {
                warn!(?err, "socket creation failed");
                return Err(SockError::Unknown);
            }
        };
        if let Err(err) = raw::set_nonblocking(os) {
            warn!(?err, "failed to set non-blocking mode");
            let _ = raw::close_socket(os);
            return Err(SockError::Unknown);
        }
        let mut have_pktinfo = false;
        if ty == Type::Dgram && cfg.request_pktinfo {
            match raw::set_pktinfo(os, domain) {
                Ok(()) => have_pktinfo = true,
                Err(err) => warn!(?err, "per-packet destination info unavailable"),
            }
        }
        let socket = Self::register(reactor, os, ty, have_pktinfo, cfg.clone())?;
        debug!(?domain, ?ty, have_pktinfo, "socket opened");
        Ok(socket)
    }

    /// Wraps an already-configured OS socket and registers it with the
    /// reactor. Closes the OS socket on failure.
    fn register(
        reactor: &Reactor,
        os: OsSocket,
        ty: Type,
        have_pktinfo: bool,
        cfg: SocketConfig,
    ) -> Result<Self, SockError> {
        #[cfg(windows)]
        let event = match raw::wsa_create_event() {
            Ok(ev) => ev,
            Err(err) => {
                warn!(?err, "event object creation failed");
                let _ = raw::close_socket(os);
                return Err(SockError::Unknown);
            }
        };

        let recv_max = cfg.recv_max;
        let inner = Rc::new(SocketInner {
            reactor: reactor.clone(),
            os,
            #[cfg(windows)]
            event,
            ty,
            have_pktinfo,
            cfg,
            token: Cell::new(None),
            wait_events: Cell::new(EventSet::empty()),
            handlers: RefCell::new(HandlerTable::default()),
            connect_state: Cell::new(ConnectState::Idle),
            connect_result: Cell::new(Ok(())),
            last_error: Cell::new(None),
            recv_max: Cell::new(recv_max),
            recv_num: Cell::new(0),
            alive: Rc::new(Cell::new(true)),
        });

        #[cfg(unix)]
        {
            let weak = Rc::downgrade(&inner);
            let callback: crate::reactor::ReadyCallback = Rc::new(move |ready| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_ready(ready);
                }
            });
            let token = reactor.register_fd(os, callback);
            inner.token.set(Some(token));
        }
        #[cfg(windows)]
        {
            let weak = Rc::downgrade(&inner);
            let callback: crate::reactor::SignalCallback = Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_signal();
                }
            });
            match reactor.register_handle(event, callback) {
                Ok(token) => inner.token.set(Some(token)),
                Err(err) => {
                    warn!(?err, "reactor registration failed");
                    inner.alive.set(false);
                    raw::wsa_close_event(event);
                    let _ = raw::close_socket(os);
                    return Err(SockError::Unknown);
                }
            }
        }

        Ok(Socket { inner })
    }

    fn inner(&self) -> &SocketInner {
        assert!(self.inner.alive.get(), "operation on closed socket");
        &self.inner
    }

    /// Whether the socket has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.inner.alive.get()
    }

    /// The socket type given at open time.
    pub fn kind(&self) -> Type {
        self.inner.ty
    }

    /// Whether per-packet destination info is active on this socket. When
    /// `false`, `send_to_from` ignores the local hint and `recv_from_to`
    /// reports no local address.
    pub fn pktinfo_enabled(&self) -> bool {
        self.inner.have_pktinfo
    }

    /// The error recorded by the most recent fallible operation; `None`
    /// after a success.
    pub fn last_error(&self) -> Option<SockError> {
        self.inner.last_error.get()
    }

    /// Closes the socket: withdraws the reactor registration, closes the
    /// OS handle, clears the handler table, and marks the liveness token
    /// dead so an in-flight dispatch unwinds without touching the socket.
    ///
    /// # Panics
    ///
    /// Panics if the socket is already closed.
    pub fn close(&self) {
        assert!(self.inner.alive.get(), "socket already closed");
        self.inner.teardown();
    }

    /// Caps receive calls per readiness notification; `-1` removes the
    /// cap. Resets the current quota usage.
    ///
    /// # Panics
    ///
    /// Panics unless `max` is positive or `-1`; `0` is rejected.
    pub fn set_recv_max(&self, max: i32) {
        assert!(max > 0 || max == -1, "recv_max must be positive or -1");
        let inner = self.inner();
        inner.recv_max.set(max);
        inner.recv_num.set(0);
    }

    // --- handler table ---

    /// Installs the global handler, which receives the full returned event
    /// set of each dispatch.
    ///
    /// # Panics
    ///
    /// Panics if a global handler is already installed or any per-event
    /// handler exists.
    pub fn install_global_handler(&self, handler: impl FnMut(EventSet) + 'static) {
        let inner = self.inner();
        let mut table = inner.handlers.borrow_mut();
        assert!(table.global.is_none(), "global handler already installed");
        assert!(
            table.per.iter().all(|slot| slot.is_none()),
            "per-event handlers are installed"
        );
        table.global = Some(Rc::new(RefCell::new(handler)));
    }

    /// Removes the global handler, clears the wait set, and reprograms the
    /// backend so no stale notifications are delivered afterwards.
    ///
    /// # Panics
    ///
    /// Panics if no global handler is installed.
    pub fn remove_global_handler(&self) {
        let inner = self.inner();
        {
            let mut table = inner.handlers.borrow_mut();
            assert!(table.global.is_some(), "no global handler installed");
            table.global = None;
        }
        inner.wait_events.set(EventSet::empty());
        inner.update_backend();
    }

    /// Replaces the waited event set while in global-handler mode. The new
    /// set must respect the event compatibility rules.
    ///
    /// # Panics
    ///
    /// Panics if no global handler is installed or `events` mixes
    /// incompatible events.
    pub fn set_global_events(&self, events: EventSet) {
        let inner = self.inner();
        assert!(
            inner.handlers.borrow().global.is_some(),
            "no global handler installed"
        );
        assert!(
            event::is_compatible(events),
            "incompatible event combination: {events:?}"
        );
        inner.wait_events.set(events);
        inner.update_backend();
    }

    /// Installs the handler for one event.
    ///
    /// # Panics
    ///
    /// Panics if a global handler is installed or the event already has a
    /// handler.
    pub fn install_event_handler(&self, event: Event, handler: impl FnMut(EventSet) + 'static) {
        let inner = self.inner();
        let mut table = inner.handlers.borrow_mut();
        assert!(table.global.is_none(), "a global handler is installed");
        assert!(
            table.per[event.index()].is_none(),
            "event already has a handler"
        );
        table.per[event.index()] = Some(Rc::new(RefCell::new(handler)));
    }

    /// Removes the handler for one event, disabling the event first if it
    /// is enabled.
    ///
    /// # Panics
    ///
    /// Panics if the event has no handler.
    pub fn remove_event_handler(&self, event: Event) {
        let inner = self.inner();
        assert!(
            inner.handlers.borrow().per[event.index()].is_some(),
            "event has no handler"
        );
        if inner.wait_events.get().contains(event) {
            self.disable_event(event);
        }
        self.inner.handlers.borrow_mut().per[event.index()] = None;
    }

    /// Starts waiting on `event` and reprograms the backend mask. Takes
    /// effect at the next reactor poll.
    ///
    /// # Panics
    ///
    /// Panics if the event has no handler, is already enabled, or
    /// conflicts with the events already waited on.
    pub fn enable_event(&self, event: Event) {
        let inner = self.inner();
        let waiting = inner.wait_events.get();
        assert!(
            waiting.phase().allows(event),
            "event {event:?} conflicts with waited events {waiting:?}"
        );
        assert!(
            inner.handlers.borrow().per[event.index()].is_some(),
            "event has no handler"
        );
        assert!(!waiting.contains(event), "event already enabled");
        inner.wait_events.set(waiting.with(event));
        inner.update_backend();
    }

    /// Stops waiting on `event` and reprograms the backend mask.
    ///
    /// # Panics
    ///
    /// Panics if the event has no handler or is not enabled.
    pub fn disable_event(&self, event: Event) {
        let inner = self.inner();
        assert!(
            inner.handlers.borrow().per[event.index()].is_some(),
            "event has no handler"
        );
        let waiting = inner.wait_events.get();
        assert!(waiting.contains(event), "event not enabled");
        inner.wait_events.set(waiting.without(event));
        inner.update_backend();
    }

    // --- connection management ---

    /// Starts a connection attempt. Returns `Ok` if the OS completed it
    /// synchronously. [`SockError::InProgress`] means the attempt is
    /// pending: enable the `Connect` event and call
    /// [`Socket::get_connect_result`] from its handler.
    ///
    /// # Panics
    ///
    /// Panics if a connection attempt is already pending or completed but
    /// unretrieved.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), SockError> {
        let inner = self.inner();
        assert_eq!(
            inner.connect_state.get(),
            ConnectState::Idle,
            "connection attempt already in progress"
        );
        let sys = addr::to_sockaddr(addr);
        match raw::connect(inner.os, &sys) {
            Ok(()) => inner.ok(()),
            Err(err) => {
                let mapped = error::map_connect_call(&err);
                if mapped == SockError::InProgress {
                    inner.connect_state.set(ConnectState::InProgress);
                }
                inner.fail(mapped)
            }
        }
    }

    /// Consumes the result of a finished connection attempt and returns
    /// the socket to the idle connect state.
    ///
    /// # Panics
    ///
    /// Panics unless a pending attempt has completed, i.e. the `Connect`
    /// event fired.
    pub fn get_connect_result(&self) -> Result<(), SockError> {
        let inner = self.inner();
        assert_eq!(
            inner.connect_state.get(),
            ConnectState::Completed,
            "no completed connection attempt"
        );
        inner.connect_state.set(ConnectState::Idle);
        inner.connect_result.get()
    }

    /// Binds the socket to a local address. Stream sockets attempt
    /// `SO_REUSEADDR` first (best-effort, logged on failure).
    pub fn bind(&self, addr: SocketAddr) -> Result<(), SockError> {
        let inner = self.inner();
        if inner.ty == Type::Stream && inner.cfg.reuse_addr {
            if let Err(err) = raw::set_reuse_addr(inner.os) {
                warn!(?err, "failed to set SO_REUSEADDR");
            }
        }
        let sys = addr::to_sockaddr(addr);
        match raw::bind(inner.os, &sys) {
            Ok(()) => inner.ok(()),
            Err(err) => inner.fail(error::map_bind(&err)),
        }
    }

    /// Starts listening. A negative `backlog` uses the configured default.
    pub fn listen(&self, backlog: i32) -> Result<(), SockError> {
        let inner = self.inner();
        let backlog = if backlog < 0 {
            inner.cfg.listen_backlog
        } else {
            backlog
        };
        match raw::listen(inner.os, backlog) {
            Ok(()) => inner.ok(()),
            Err(err) => inner.fail(error::map_listen(&err)),
        }
    }

    /// Accepts a pending connection as a new registered non-blocking
    /// socket of the same type (without the pktinfo option), along with
    /// the peer address. [`SockError::Later`] when none is pending.
    pub fn accept(&self) -> Result<(Socket, SocketAddr), SockError> {
        let inner = self.inner();
        let (os, sys) = match raw::accept(inner.os) {
            Ok(accepted) => accepted,
            Err(err) => return inner.fail(error::map_accept(&err)),
        };
        let peer = match addr::from_sockaddr(&sys) {
            Ok(peer) => peer,
            Err(err) => {
                let _ = raw::close_socket(os);
                return inner.fail(err);
            }
        };
        if let Err(err) = raw::set_nonblocking(os) {
            warn!(?err, "failed to set non-blocking mode on accepted socket");
            let _ = raw::close_socket(os);
            return inner.fail(SockError::Unknown);
        }
        match Self::register(&inner.reactor, os, inner.ty, false, SocketConfig::default()) {
            Ok(socket) => inner.ok((socket, peer)),
            Err(err) => inner.fail(err),
        }
    }

    /// Accepts a pending connection and closes it immediately, reporting
    /// only the peer address. Used for draining or rejecting connections.
    pub fn accept_discard(&self) -> Result<SocketAddr, SockError> {
        let inner = self.inner();
        let (os, sys) = match raw::accept(inner.os) {
            Ok(accepted) => accepted,
            Err(err) => return inner.fail(error::map_accept(&err)),
        };
        let peer = addr::from_sockaddr(&sys);
        if let Err(err) = raw::close_socket(os) {
            debug!(?err, "failed to close discarded connection");
        }
        match peer {
            Ok(peer) => inner.ok(peer),
            Err(err) => inner.fail(err),
        }
    }

    // --- data transfer ---

    /// Sends on a connected socket.
    pub fn send(&self, buf: &[u8]) -> Result<usize, SockError> {
        let inner = self.inner();
        match raw::send(inner.os, buf) {
            Ok(n) => inner.ok(n),
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    /// Receives on a connected socket. Counts against the receive quota.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, SockError> {
        let inner = self.inner();
        if inner.limit_recv() {
            return inner.fail(SockError::Later);
        }
        match raw::recv(inner.os, buf) {
            Ok(n) => inner.ok(n),
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    /// Sends one datagram to `addr`.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SockError> {
        let inner = self.inner();
        let sys = addr::to_sockaddr(addr);
        match raw::send_to(inner.os, buf, &sys) {
            Ok(n) => inner.ok(n),
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    /// Receives one datagram and its sender address. Counts against the
    /// receive quota.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError> {
        let inner = self.inner();
        if inner.limit_recv() {
            return inner.fail(SockError::Later);
        }
        match raw::recv_from(inner.os, buf) {
            Ok((n, sys)) => match addr::from_sockaddr(&sys) {
                Ok(peer) => inner.ok((n, peer)),
                Err(err) => inner.fail(err),
            },
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    /// Sends one datagram to `addr`, selecting the source address `local`
    /// when given. Degrades to [`Socket::send_to`] (the hint is dropped)
    /// when per-packet info is not active on this socket.
    pub fn send_to_from(
        &self,
        buf: &[u8],
        addr: SocketAddr,
        local: Option<IpAddr>,
    ) -> Result<usize, SockError> {
        let inner = self.inner();
        if !inner.have_pktinfo {
            return self.send_to(buf, addr);
        }
        #[cfg(windows)]
        let Some(func) = pktinfo::sendmsg_extension(inner.os) else {
            return self.send_to(buf, addr);
        };
        let sys = addr::to_sockaddr(addr);
        #[cfg(unix)]
        let sent = pktinfo::send_msg(inner.os, buf, &sys, local);
        #[cfg(windows)]
        let sent = pktinfo::send_msg(inner.os, func, buf, &sys, local);
        match sent {
            Ok(n) => inner.ok(n),
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    /// Receives one datagram together with its sender address and, when
    /// per-packet info is active, the local destination IP it was sent
    /// to. Degrades to [`Socket::recv_from`] with a `None` local address
    /// otherwise. Counts against the receive quota.
    pub fn recv_from_to(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr, Option<IpAddr>), SockError> {
        let inner = self.inner();
        if !inner.have_pktinfo {
            let (n, peer) = self.recv_from(buf)?;
            return Ok((n, peer, None));
        }
        #[cfg(windows)]
        let Some(func) = pktinfo::recvmsg_extension(inner.os) else {
            let (n, peer) = self.recv_from(buf)?;
            return Ok((n, peer, None));
        };
        if inner.limit_recv() {
            return inner.fail(SockError::Later);
        }
        #[cfg(unix)]
        let received = pktinfo::recv_msg(inner.os, buf);
        #[cfg(windows)]
        let received = pktinfo::recv_msg(inner.os, func, buf);
        match received {
            Ok(msg) => match addr::from_sockaddr(&msg.remote) {
                Ok(peer) => inner.ok((msg.len, peer, msg.local)),
                Err(err) => inner.fail(err),
            },
            Err(err) => inner.fail(error::map_transfer(&err, inner.ty)),
        }
    }

    // --- introspection ---

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, SockError> {
        let inner = self.inner();
        match raw::local_name(inner.os) {
            Ok(sys) => match addr::from_sockaddr(&sys) {
                Ok(local) => inner.ok(local),
                Err(err) => inner.fail(err),
            },
            Err(_) => inner.fail(SockError::Unknown),
        }
    }

    /// The connected peer's address.
    pub fn peer_addr(&self) -> Result<SocketAddr, SockError> {
        let inner = self.inner();
        match raw::peer_name(inner.os) {
            Ok(sys) => match addr::from_sockaddr(&sys) {
                Ok(peer) => inner.ok(peer),
                Err(err) => inner.fail(err),
            },
            Err(_) => inner.fail(SockError::Unknown),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.os
    }
}

#[cfg(windows)]
impl AsRawSocket for Socket {
    fn as_raw_socket(&self) -> RawSocket {
        self.inner.os
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("os", &self.inner.os)
            .field("ty", &self.inner.ty)
            .field("open", &self.inner.alive.get())
            .field("wait_events", &self.inner.wait_events.get())
            .finish()
    }
}

impl SocketInner {
    fn ok<T>(&self, value: T) -> Result<T, SockError> {
        self.last_error.set(None);
        Ok(value)
    }

    fn fail<T>(&self, err: SockError) -> Result<T, SockError> {
        self.last_error.set(Some(err));
        Err(err)
    }

    /// Spends one unit of receive quota; `true` means the quota is gone
    /// and the caller must report `Later` without touching the OS.
    fn limit_recv(&self) -> bool {
        let max = self.recv_max.get();
        if max > 0 {
            if self.recv_num.get() >= max {
                return true;
            }
            self.recv_num.set(self.recv_num.get() + 1);
        }
        false
    }

    /// Reprograms the backend with the OS-level readiness implied by the
    /// current wait set: `Read`/`Accept` wait for readability,
    /// `Write`/`Connect` for writability.
    #[cfg(unix)]
    fn update_backend(&self) {
        let Some(token) = self.token.get() else {
            return;
        };
        let waiting = self.wait_events.get();
        let mut ready = Ready::empty();
        if waiting.contains(Event::Read) || waiting.contains(Event::Accept) {
            ready = ready | Ready::READABLE;
        }
        if waiting.contains(Event::Write) || waiting.contains(Event::Connect) {
            ready = ready | Ready::WRITABLE;
        }
        self.reactor.set_fd_events(token, ready);
    }

    /// Reprograms the backend with the FD_* conditions implied by the
    /// current wait set. `Read` and `Write` also watch `FD_CLOSE` so a
    /// peer teardown is observable as readiness.
    #[cfg(windows)]
    fn update_backend(&self) {
        let waiting = self.wait_events.get();
        let mut mask: i32 = 0;
        if waiting.contains(Event::Read) {
            mask |= FD_READ as i32 | FD_CLOSE as i32;
        }
        if waiting.contains(Event::Write) {
            mask |= FD_WRITE as i32 | FD_CLOSE as i32;
        }
        if waiting.contains(Event::Accept) {
            mask |= FD_ACCEPT as i32;
        }
        if waiting.contains(Event::Connect) {
            mask |= FD_CONNECT as i32;
        }
        let res = raw::wsa_event_select(self.os, self.event, mask);
        assert!(res.is_ok(), "WSAEventSelect failed: {:?}", res.err());
    }

    /// POSIX readiness entry point: translates OS readiness into logical
    /// events masked by the wait set, resolves a pending connect, and
    /// dispatches.
    #[cfg(unix)]
    fn handle_ready(&self, ready: Ready) {
        let waiting = self.wait_events.get();
        let mut returned = EventSet::empty();
        if waiting.contains(Event::Read) && ready.is_readable() {
            returned |= Event::Read;
        }
        if waiting.contains(Event::Write) && ready.is_writable() {
            returned |= Event::Write;
        }
        if waiting.contains(Event::Accept) && ready.is_readable() {
            returned |= Event::Accept;
        }
        if waiting.contains(Event::Connect) && ready.is_writable() {
            debug_assert_eq!(self.connect_state.get(), ConnectState::InProgress);
            let result = match raw::take_so_error(self.os) {
                Ok(code) => error::map_connect_result(code),
                Err(err) => {
                    warn!(?err, "failed to read SO_ERROR after connect");
                    Err(SockError::Unknown)
                }
            };
            self.connect_state.set(ConnectState::Completed);
            self.connect_result.set(result);
            returned |= Event::Connect;
        }
        self.dispatch(returned);
    }

    /// Windows notification entry point: enumerates (and resets) the
    /// recorded FD_* conditions, translates them into logical events
    /// masked by the wait set, and dispatches.
    #[cfg(windows)]
    fn handle_signal(&self) {
        let events = match raw::wsa_enum_events(self.os, self.event) {
            Ok(events) => events,
            Err(err) => {
                warn!(?err, "WSAEnumNetworkEvents failed");
                return;
            }
        };
        let net = events.lNetworkEvents as i32;
        let waiting = self.wait_events.get();
        let mut returned = EventSet::empty();
        if waiting.contains(Event::Read) && (net & (FD_READ as i32 | FD_CLOSE as i32)) != 0 {
            returned |= Event::Read;
        }
        if waiting.contains(Event::Write) && (net & (FD_WRITE as i32 | FD_CLOSE as i32)) != 0 {
            returned |= Event::Write;
        }
        if waiting.contains(Event::Accept) && (net & FD_ACCEPT as i32) != 0 {
            returned |= Event::Accept;
        }
        if waiting.contains(Event::Connect) && (net & FD_CONNECT as i32) != 0 {
            debug_assert_eq!(self.connect_state.get(), ConnectState::InProgress);
            self.connect_state.set(ConnectState::Completed);
            self.connect_result
                .set(error::map_connect_result(
                    events.iErrorCode[FD_CONNECT_BIT as usize],
                ));
            returned |= Event::Connect;
        }
        self.dispatch(returned);
    }

    /// Invokes handlers for the returned events. Resets the receive quota
    /// first. A global handler gets the whole set at once; per-event
    /// handlers run in the fixed order, and dispatch aborts as soon as the
    /// liveness token shows a handler destroyed the socket.
    fn dispatch(&self, returned: EventSet) {
        self.recv_num.set(0);
        if returned.is_empty() {
            return;
        }
        trace!(events = ?returned, "dispatching");
        let global = self.handlers.borrow().global.clone();
        if let Some(handler) = global {
            (&mut *handler.borrow_mut())(returned);
            return;
        }
        let alive = Rc::clone(&self.alive);
        for event in Event::DISPATCH_ORDER {
            if !returned.contains(event) {
                continue;
            }
            let handler = self.handlers.borrow().per[event.index()].clone();
            let Some(handler) = handler else {
                debug_assert!(false, "waited event without handler");
                continue;
            };
            (&mut *handler.borrow_mut())(EventSet::from(event));
            if !alive.get() {
                return;
            }
        }
    }

    /// Releases the reactor registration and the OS handle, marks the
    /// liveness token dead, and drops all handlers (breaking the reference
    /// cycle between the socket and closures that captured it).
    fn teardown(&self) {
        self.alive.set(false);
        if let Some(token) = self.token.take() {
            #[cfg(unix)]
            self.reactor.deregister_fd(token);
            #[cfg(windows)]
            self.reactor.deregister_handle(token);
        }
        #[cfg(windows)]
        {
            let _ = raw::wsa_event_select(self.os, self.event, 0);
            raw::wsa_close_event(self.event);
        }
        if let Err(err) = raw::close_socket(self.os) {
            warn!(?err, "failed to close socket handle");
        }
        self.handlers.borrow_mut().clear();
        debug!("socket closed");
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if self.alive.get() {
            self.teardown();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn reactor() -> Reactor {
        Reactor::new().unwrap()
    }

    #[test]
    fn test_open_bind_close() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
        assert!(socket.is_open());
        assert!(socket.pktinfo_enabled());
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(socket.last_error(), None);
        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        socket.close();
        assert!(!socket.is_open());
    }

    #[test]
    fn test_stream_socket_has_no_pktinfo() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
        assert!(!socket.pktinfo_enabled());
        assert_eq!(socket.kind(), Type::Stream);
        socket.close();
    }

    #[test]
    #[should_panic(expected = "per-event handlers are installed")]
    fn test_handler_modes_are_exclusive() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
        socket.install_event_handler(Event::Read, |_| {});
        socket.install_global_handler(|_| {});
    }

    #[test]
    #[should_panic(expected = "event has no handler")]
    fn test_enable_requires_handler() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
        socket.enable_event(Event::Read);
    }

    #[test]
    #[should_panic(expected = "conflicts with waited events")]
    fn test_incompatible_events_rejected() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
        socket.install_event_handler(Event::Read, |_| {});
        socket.install_event_handler(Event::Accept, |_| {});
        socket.enable_event(Event::Read);
        socket.enable_event(Event::Accept);
    }

    #[test]
    #[should_panic(expected = "recv_max must be positive or -1")]
    fn test_recv_max_zero_rejected() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
        socket.set_recv_max(0);
    }

    #[test]
    fn test_remove_event_handler_disables_event() {
        let reactor = reactor();
        let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
        socket.install_event_handler(Event::Read, |_| {});
        socket.enable_event(Event::Read);
        socket.remove_event_handler(Event::Read);
        // The event was auto-disabled, so a fresh handler can be installed
        // and enabled again without tripping the enabled assertion.
        socket.install_event_handler(Event::Read, |_| {});
        socket.enable_event(Event::Read);
        socket.close();
    }
}
