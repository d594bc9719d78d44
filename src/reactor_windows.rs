//! WSA-event reactor backend for Windows
//!
//! Windows sockets signal network conditions through event objects
//! programmed with `WSAEventSelect`. This reactor waits on the registered
//! objects with `WSAWaitForMultipleEvents` and invokes the owning socket's
//! callback when one is signaled; the socket then enumerates (and thereby
//! resets) the recorded conditions with `WSAEnumNetworkEvents`.
//!
//! At most `WSA_MAXIMUM_WAIT_EVENTS` (64) objects can be waited on at
//! once, a WinSock limit this backend inherits.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    WSAEVENT, WSA_MAXIMUM_WAIT_EVENTS, WSA_WAIT_EVENT_0, WSA_WAIT_FAILED, WSA_WAIT_TIMEOUT,
};

use crate::raw;

/// Identifies an event-object registration within its reactor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandleToken(usize);

/// Per-object notification callback.
pub(crate) type SignalCallback = Rc<dyn Fn()>;

struct HandleEntry {
    event: WSAEVENT,
    callback: SignalCallback,
}

struct Inner {
    slots: RefCell<Vec<Option<HandleEntry>>>,
    poll_timeout: Cell<Duration>,
}

/// Single-threaded cooperative reactor.
///
/// Cloning produces another handle to the same event loop; sockets keep
/// one so they can manage their registration. All use must stay on one
/// thread.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates a new reactor.
    pub fn new() -> io::Result<Self> {
        raw::global_init()?;
        Ok(Self {
            inner: Rc::new(Inner {
                slots: RefCell::new(Vec::new()),
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

    /// Adds an event object to the wait set.
    pub(crate) fn register_handle(
        &self,
        event: WSAEVENT,
        callback: SignalCallback,
    ) -> io::Result<HandleToken> {
        let mut slots = self.inner.slots.borrow_mut();
        let live = slots.iter().filter(|s| s.is_some()).count();
        if live >= WSA_MAXIMUM_WAIT_EVENTS as usize {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "WSA wait set is full",
            ));
        }
        let entry = HandleEntry { event, callback };
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(HandleToken(i));
            }
        }
        slots.push(Some(entry));
        Ok(HandleToken(slots.len() - 1))
    }

    /// Removes an event object from the wait set.
    pub(crate) fn deregister_handle(&self, token: HandleToken) {
        let mut slots = self.inner.slots.borrow_mut();
        debug_assert!(
            slots.get(token.0).map(|s| s.is_some()).unwrap_or(false),
            "deregister_handle on unregistered object"
        );
        if let Some(slot) = slots.get_mut(token.0) {
            *slot = None;
        }
    }

    /// Waits once for any registered object to be signaled and dispatches
    /// its callback. Returns the number of objects dispatched (0 or 1).
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let (handles, tokens): (Vec<WSAEVENT>, Vec<usize>) = {
            let slots = self.inner.slots.borrow();
            slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|e| (e.event, i)))
                .unzip()
        };
        if handles.is_empty() {
            if let Some(t) = timeout {
                std::thread::sleep(t);
            }
            return Ok(0);
        }

        let timeout_ms = timeout
            .map(|t| t.as_millis().min(u128::from(u32::MAX - 1)) as u32)
            .unwrap_or(u32::MAX);
        let rc = unsafe {
            windows_sys::Win32::Networking::WinSock::WSAWaitForMultipleEvents(
                handles.len() as u32,
                handles.as_ptr(),
                0,
                timeout_ms,
                0,
            )
        };
        if rc == WSA_WAIT_FAILED {
            return Err(raw::last_error());
        }
        if rc == WSA_WAIT_TIMEOUT {
            return Ok(0);
        }
        let index = (rc - WSA_WAIT_EVENT_0) as usize;
        // Registration may have been removed between collecting the wait
        // set and the wakeup.
        let callback = {
            let slots = self.inner.slots.borrow();
            match tokens.get(index) {
                Some(&slot_index) => slots
                    .get(slot_index)
                    .and_then(|s| s.as_ref())
                    .map(|e| e.callback.clone()),
                None => None,
            }
        };
        match callback {
            Some(cb) => {
                (*cb)();
                Ok(1)
            }
            None => Ok(0),
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
        let live = self
            .inner
            .slots
            .borrow()
            .iter()
            .filter(|s| s.is_some())
            .count();
        f.debug_struct("Reactor")
            .field("registered", &live)
            .field("poll_timeout", &self.inner.poll_timeout.get())
            .finish()
    }
}
