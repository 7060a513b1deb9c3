//! Module containing the error type returned by the socket primitives.

use std::{fmt, io};

use crate::net::Handle;

/// A specialised [`Result`] type for socket operations.
///
/// [`Result`]: std::result::Result
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by the socket primitives, see [`net::Socket`].
///
/// The error contains the [kind] of error, the [operation] that failed, the
/// [handle] of the socket it failed on (if the socket was already created) and
/// the underlying OS error, if any.
///
/// [`net::Socket`]: crate::net::Socket
/// [kind]: Error::kind
/// [operation]: Error::operation
/// [handle]: Error::handle
///
/// # Examples
///
/// Using a socket after it's closed.
///
/// ```
/// use ssock::net::Socket;
/// use ssock::ErrorKind;
///
/// # fn main() -> ssock::Result<()> {
/// let mut socket = Socket::create()?;
/// socket.close()?;
///
/// let err = socket.close().unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::Closed);
/// assert!(err.os_code().is_none());
/// # Ok(())
/// # }
/// ```
pub struct Error {
    kind: ErrorKind,
    op: Operation,
    handle: Option<Handle>,
    source: Option<io::Error>,
}

/// The kind of [`Error`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The OS couldn't allocate a new socket, e.g. too many open files.
    ResourceExhausted,
    /// The port (or address) is already in use.
    AddressInUse,
    /// Not allowed to perform the operation, e.g. binding to a privileged
    /// port.
    PermissionDenied,
    /// The host name couldn't be resolved to an IPv4 address.
    HostNotFound,
    /// Nobody is listening on the remote address, or the listener's backlog
    /// is full.
    ConnectionRefused,
    /// The peer closed (or reset) the connection while we tried to use it.
    ///
    /// Note that a graceful close is reported by [`Socket::recv`] returning
    /// zero, not by this error.
    ///
    /// [`Socket::recv`]: crate::net::Socket::recv
    PeerClosed,
    /// The system call was interrupted by a signal before it could complete.
    /// The operation can be retried.
    Interrupted,
    /// The socket was already closed by [`Socket::close`].
    ///
    /// [`Socket::close`]: crate::net::Socket::close
    Closed,
    /// Any other error returned by the OS.
    Transport,
}

impl ErrorKind {
    /// Returns a short description of the kind of error.
    const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::HostNotFound => "host not found",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::PeerClosed => "peer closed connection",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Closed => "socket already closed",
            ErrorKind::Transport => "transport error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The socket operation that failed, including its arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Operation {
    /// [`Socket::create`](crate::net::Socket::create).
    Create,
    /// [`Socket::bind`](crate::net::Socket::bind) to port.
    Bind(u16),
    /// [`Socket::listen`](crate::net::Socket::listen) with backlog.
    Listen(i32),
    /// [`Socket::accept`](crate::net::Socket::accept).
    Accept,
    /// [`Socket::connect`](crate::net::Socket::connect) to host and port.
    Connect(String, u16),
    /// [`Socket::send`](crate::net::Socket::send) of length.
    Send(usize),
    /// [`Socket::recv`](crate::net::Socket::recv) with buffer capacity.
    Recv(usize),
    /// [`Socket::close`](crate::net::Socket::close).
    Close,
    /// Any of the other methods on [`Socket`](crate::net::Socket), e.g.
    /// getting the local address or setting an option.
    Other(&'static str),
}

impl Error {
    /// Create a new error from an `io::Error` returned by the OS.
    ///
    /// The [`ErrorKind`] is determined based on the `op` and `err`.
    pub(crate) fn os(op: Operation, handle: Option<Handle>, err: io::Error) -> Error {
        Error {
            kind: classify(&op, &err),
            op,
            handle,
            source: Some(err),
        }
    }

    /// Create a new error that doesn't have an OS error as cause.
    pub(crate) const fn new(kind: ErrorKind, op: Operation, handle: Option<Handle>) -> Error {
        Error {
            kind,
            op,
            handle,
            source: None,
        }
    }

    /// Create a new [`ErrorKind::HostNotFound`] error, optionally including
    /// the resolver's error.
    pub(crate) fn host_not_found(op: Operation, handle: Handle, err: Option<io::Error>) -> Error {
        Error {
            kind: ErrorKind::HostNotFound,
            op,
            handle: Some(handle),
            source: err,
        }
    }

    /// Returns the kind of error.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the operation that failed.
    pub const fn operation(&self) -> &Operation {
        &self.op
    }

    /// Returns the handle of the socket the operation failed on, if the socket
    /// was created.
    pub const fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// Returns the OS error code, e.g. `ECONNREFUSED`, if the error was
    /// returned by the OS.
    pub fn os_code(&self) -> Option<i32> {
        self.source.as_ref().and_then(io::Error::raw_os_error)
    }

    /// Returns `true` if the operation can be retried, i.e. it was
    /// interrupted or the connection was aborted before it could be accepted.
    pub(crate) fn is_retryable(&self) -> bool {
        match (&self.op, self.kind, &self.source) {
            (_, ErrorKind::Interrupted, _) => true,
            (Operation::Accept, _, Some(err)) => {
                err.kind() == io::ErrorKind::ConnectionAborted
                    || err.raw_os_error() == Some(libc::ECONNABORTED)
            }
            _ => false,
        }
    }
}

/// Determine the [`ErrorKind`] of an OS error for operation `op`.
fn classify(op: &Operation, err: &io::Error) -> ErrorKind {
    use io::ErrorKind::*;
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                return ErrorKind::ResourceExhausted
            }
            libc::EBADF => return ErrorKind::Closed,
            _ => {}
        }
    }
    match (op, err.kind()) {
        (_, Interrupted) => ErrorKind::Interrupted,
        (_, AddrInUse) => ErrorKind::AddressInUse,
        (_, PermissionDenied) => ErrorKind::PermissionDenied,
        (_, ConnectionRefused) => ErrorKind::ConnectionRefused,
        (Operation::Send(_) | Operation::Recv(_), BrokenPipe | ConnectionReset) => {
            ErrorKind::PeerClosed
        }
        _ => ErrorKind::Transport,
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err.kind {
            ErrorKind::ResourceExhausted => io::ErrorKind::Other,
            ErrorKind::AddressInUse => io::ErrorKind::AddrInUse,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::HostNotFound => io::ErrorKind::NotFound,
            ErrorKind::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            ErrorKind::PeerClosed => io::ErrorKind::BrokenPipe,
            ErrorKind::Interrupted => io::ErrorKind::Interrupted,
            ErrorKind::Closed => io::ErrorKind::InvalidInput,
            ErrorKind::Transport => match err.source {
                Some(ref source) => source.kind(),
                None => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err)
    }
}

/// We implement [`Debug`] by using [`Display`] implementation because the
/// [`Termination`] trait uses `Debug` rather then `Display` when returning an
/// `Result`.
///
/// [`Termination`]: std::process::Termination
/// [`Debug`]: std::fmt::Debug
/// [`Display`]: std::fmt::Display
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Operation::*;
        let handle = HandleDisplay(self.handle);
        match self.op {
            Create => f.write_str("error creating socket")?,
            Bind(port) => write!(f, "error binding socket {handle} to port {port}")?,
            Listen(backlog) => write!(
                f,
                "error listening on socket {handle} with backlog {backlog}"
            )?,
            Accept => write!(f, "error accepting connection on socket {handle}")?,
            Connect(ref host, port) => {
                write!(f, "error connecting socket {handle} to {host}:{port}")?
            }
            Send(len) => write!(f, "error sending {len} bytes on socket {handle}")?,
            Recv(capacity) => write!(
                f,
                "error receiving up to {capacity} bytes on socket {handle}"
            )?,
            Close => write!(f, "error closing socket {handle}")?,
            Other(what) => write!(f, "error {what} for socket {handle}")?,
        }
        match self.source {
            Some(ref err) => write!(f, ": {}: {err}", self.kind),
            None => write!(f, ": {}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            Some(ref err) => Some(err),
            None => None,
        }
    }
}

/// Displays an optional handle, using `<none>` if not set.
struct HandleDisplay(Option<Handle>);

impl fmt::Display for HandleDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(handle) => fmt::Display::fmt(&handle, f),
            None => f.write_str("<none>"),
        }
    }
}
