//! Network related types.
//!
//! The main type is [`Socket`], a blocking TCP socket that exposes the
//! individual steps of a connection's lifecycle as methods:
//!
//!  * [`Socket::create`] a new socket,
//!  * [`Socket::bind`] it to a port and [`Socket::listen`] for incoming
//!    connections, which can be accepted using [`Socket::accept`], or
//!  * [`Socket::connect`] to a remote host,
//!  * [`Socket::send`] and [`Socket::recv`] bytes, and finally
//!  * [`Socket::close`] it.
//!
//! Each operation maps to a single system call, nothing is buffered, framed or
//! retried. Errors are returned as [`Error`] which includes the failing
//! operation, the socket's [`Handle`] and the OS error.
//!
//! [`Error`]: crate::Error

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

mod socket;


pub use socket::Socket;

/// Opaque identifier of a socket.
///
/// Every [`Socket`] gets a new handle when it's created (or accepted), handles
/// are never reused within the process, not even after the socket is closed.
/// This differs from the file descriptor, which the OS reuses for new sockets.
/// The handle is only used to identify the socket in logs and errors, it can't
/// be used to perform any operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Handle(u64);

/// Id of the next handle.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl Handle {
    /// Returns a new, unique, handle.
    pub(crate) fn next() -> Handle {
        Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the handle as integer.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
