//! Socket configuration
//!
//! Per-socket knobs applied at open time. All fields have defaults that
//! suit a typical reactor-driven server; construct with struct-update
//! syntax to override individual values:
//!
//! ```rust
//! use evsock::SocketConfig;
//!
//! let cfg = SocketConfig {
//!     recv_max: 16,
//!     ..Default::default()
//! };
//! assert_eq!(cfg.recv_max, 16);
//! ```

/// Configuration applied when a socket is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketConfig {
    /// Receive-quota cap: the number of receive calls allowed per readiness
    /// notification before the socket reports "later" and yields. Keeps one
    /// chatty socket from starving others sharing the reactor.
    ///
    /// Positive values cap; `-1` disables the cap. `0` is rejected.
    ///
    /// **Default**: `64`
    pub recv_max: i32,

    /// Listen backlog used when `listen` is called with a negative value.
    ///
    /// **Default**: `128`
    pub listen_backlog: i32,

    /// Attempt `SO_REUSEADDR` before binding a stream socket. Best-effort:
    /// failure is logged and ignored.
    ///
    /// **Default**: `true`
    pub reuse_addr: bool,

    /// Attempt the per-packet destination info socket option on datagram
    /// sockets. Best-effort: when the option is unavailable (or this is
    /// `false`), `recv_from_to` degrades to `recv_from` and reports no
    /// local address.
    ///
    /// **Default**: `true`
    pub request_pktinfo: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_max: 64,
            listen_backlog: 128,
            reuse_addr: true,
            request_pktinfo: true,
        }
    }
}
