//! Mio-based reactor backend for POSIX systems
//!
//! A single-threaded event loop over `mio::Poll` (epoll on Linux, kqueue
//! on macOS/BSD) that watches raw file descriptors with `SourceFd` and
//! dispatches readiness to per-descriptor callbacks.
//!
//! Delivery is level-triggered: after dispatching readiness for a
//! descriptor the reactor re-arms it, so a socket that left data unread
//! (for example because its receive quota ran out) is reported again on
//! the next poll cycle. mio's native edge-triggered behavior alone would
//! drop that guarantee.
//!
//! Callbacks may freely register, reprogram, or deregister descriptors --
//! including their own -- while the reactor is dispatching; no internal
//! borrow is held across a callback invocation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::warn;

/// OS-level readiness, the reactor's native event currency.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct Ready(u8);

impl Ready {
    /// The descriptor is readable.
    pub const READABLE: Ready = Ready(1 << 0);
    /// The descriptor is writable.
    pub const WRITABLE: Ready = Ready(1 << 1);

    /// The empty readiness set.
    pub const fn empty() -> Self {
        Ready(0)
    }

    /// Whether no readiness bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the readable bit is set.
    pub fn is_readable(self) -> bool {
        self.0 & Ready::READABLE.0 != 0
    }

    /// Whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0 & Ready::WRITABLE.0 != 0
    }

    /// Union of two readiness sets.
    #[must_use]
    pub fn union(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    fn intersect(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }

    fn to_interest(self) -> Option<Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl std::ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        self.union(rhs)
    }
}

/// Identifies a descriptor registration within its reactor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FdToken(Token);

/// Per-descriptor readiness callback.
pub(crate) type ReadyCallback = Rc<dyn Fn(Ready)>;

struct FdEntry {
    fd: RawFd,
    interest: Ready,
    /// Whether the descriptor is currently registered with the OS poller.
    /// Descriptors with an empty interest set stay in the table unarmed.
    armed: bool,
    callback: ReadyCallback,
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    fds: RefCell<HashMap<Token, FdEntry>>,
    next_token: Cell<usize>,
    poll_timeout: Cell<Duration>,
}

/// Single-threaded cooperative reactor.
///
/// Cloning produces another handle to the same event loop; sockets keep
/// one so they can reprogram their registration. All use must stay on one
/// thread.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates a new reactor with default event capacity.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(4096)
    }

    /// Creates a reactor with custom event batch capacity.
    pub fn with_capacity(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(Poll::new()?),
                events: RefCell::new(Events::with_capacity(event_capacity)),
                fds: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
                poll_timeout: Cell::new(Duration::from_millis(10)),
            }),
        })
    }

    /// Sets the timeout used by [`Reactor::run`] for each poll iteration.
    pub fn set_poll_timeout(&self, timeout: Duration) {
        self.inner.poll_timeout.set(timeout);
    }

    /// Gets the current run-loop polling timeout.
    pub fn poll_timeout(&self) -> Duration {
        self.inner.poll_timeout.get()
    }

    /// Adds a descriptor to the table. The descriptor is not armed with
    /// the OS poller until a non-empty interest is set.
    pub(crate) fn register_fd(&self, fd: RawFd, callback: ReadyCallback) -> FdToken {
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        self.inner.fds.borrow_mut().insert(
            token,
            FdEntry {
                fd,
                interest: Ready::empty(),
                armed: false,
                callback,
            },
        );
        FdToken(token)
    }

    /// Reprograms which readiness conditions are watched for a descriptor.
    /// Takes effect at the next poll.
    pub(crate) fn set_fd_events(&self, token: FdToken, ready: Ready) {
        let mut fds = self.inner.fds.borrow_mut();
        let Some(entry) = fds.get_mut(&token.0) else {
            debug_assert!(false, "set_fd_events on unregistered descriptor");
            return;
        };
        entry.interest = ready;
        let poll = self.inner.poll.borrow();
        let registry = poll.registry();
        let res = match (ready.to_interest(), entry.armed) {
            (Some(interest), true) => registry.reregister(&mut SourceFd(&entry.fd), token.0, interest),
            (Some(interest), false) => {
                entry.armed = true;
                registry.register(&mut SourceFd(&entry.fd), token.0, interest)
            }
            (None, true) => {
                entry.armed = false;
                registry.deregister(&mut SourceFd(&entry.fd))
            }
            (None, false) => Ok(()),
        };
        if let Err(err) = res {
            warn!(fd = entry.fd, ?err, "failed to reprogram poller registration");
        }
    }

    /// Removes a descriptor from the table and the OS poller.
    pub(crate) fn deregister_fd(&self, token: FdToken) {
        let Some(entry) = self.inner.fds.borrow_mut().remove(&token.0) else {
            debug_assert!(false, "deregister_fd on unregistered descriptor");
            return;
        };
        if entry.armed {
            let poll = self.inner.poll.borrow();
            if let Err(err) = poll.registry().deregister(&mut SourceFd(&entry.fd)) {
                warn!(fd = entry.fd, ?err, "failed to deregister descriptor");
            }
        }
    }

    /// Polls once and dispatches readiness to registered callbacks.
    ///
    /// Returns the number of descriptors dispatched. A descriptor whose
    /// registration disappeared between polling and dispatch (a callback
    /// earlier in the same cycle closed it) is skipped.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut pending: Vec<(Token, Ready)> = Vec::new();
        {
            let mut poll = self.inner.poll.borrow_mut();
            let mut events = self.inner.events.borrow_mut();
            loop {
                match poll.poll(&mut events, timeout) {
                    Ok(()) => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            for ev in events.iter() {
                let mut ready = Ready::empty();
                // Error and hang-up conditions are folded into both
                // directions so the owner observes them on whichever
                // event it is waiting for, matching poll(2) semantics.
                if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                    ready = ready | Ready::READABLE;
                }
                if ev.is_writable() || ev.is_write_closed() || ev.is_error() {
                    ready = ready | Ready::WRITABLE;
                }
                if !ready.is_empty() {
                    pending.push((ev.token(), ready));
                }
            }
        }

        let mut dispatched = 0;
        for (token, ready) in pending {
            let hit = {
                let fds = self.inner.fds.borrow();
                fds.get(&token)
                    .map(|entry| (entry.callback.clone(), entry.interest))
            };
            let Some((callback, interest)) = hit else {
                continue;
            };
            let delivered = ready.intersect(interest);
            if !delivered.is_empty() {
                dispatched += 1;
                (*callback)(delivered);
            }
            self.rearm(token);
        }
        Ok(dispatched)
    }

    /// Re-arms a dispatched descriptor so readiness that was not fully
    /// drained is reported again on the next cycle.
    fn rearm(&self, token: Token) {
        let fds = self.inner.fds.borrow();
        let Some(entry) = fds.get(&token) else {
            return;
        };
        if !entry.armed {
            return;
        }
        let Some(interest) = entry.interest.to_interest() else {
            return;
        };
        let poll = self.inner.poll.borrow();
        if let Err(err) = poll
            .registry()
            .reregister(&mut SourceFd(&entry.fd), token, interest)
        {
            warn!(fd = entry.fd, ?err, "failed to re-arm descriptor");
        }
    }

    /// Runs the event loop indefinitely using the configured poll timeout.
    pub fn run(&self) -> io::Result<()> {
        loop {
            self.poll_once(Some(self.inner.poll_timeout.get()))?;
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registered", &self.inner.fds.borrow().len())
            .field("poll_timeout", &self.inner.poll_timeout.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_creation() {
        assert!(Reactor::new().is_ok());
        assert!(Reactor::with_capacity(64).is_ok());
    }

    #[test]
    fn test_poll_timeout_configuration() {
        let reactor = Reactor::new().unwrap();
        reactor.set_poll_timeout(Duration::from_millis(5));
        assert_eq!(reactor.poll_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_poll_once_empty() {
        let reactor = Reactor::new().unwrap();
        let n = reactor.poll_once(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_ready_algebra() {
        let both = Ready::READABLE | Ready::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(Ready::empty().is_empty());
        assert_eq!(Ready::READABLE.to_interest(), Some(Interest::READABLE));
        assert_eq!(Ready::empty().to_interest(), None);
    }
}
