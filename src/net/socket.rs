//! Module with [`Socket`].

use std::io::Read;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd};

use log::trace;
use socket2::{Domain, Protocol, Type};

use crate::error::{Error, ErrorKind, Operation, Result};
use crate::net::Handle;

/// Flags passed to `send(2)`, prevents `SIGPIPE` on platforms that support
/// it. Other platforms set `SO_NOSIGPIPE` on the socket instead.
#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
)))]
const SEND_FLAGS: libc::c_int = 0;

/// A blocking IPv4 TCP socket.
///
/// A socket is either used as listener, see [`bind`], [`listen`] and
/// [`accept`], or as connection to a single peer, see [`connect`] (or
/// `accept`), [`send`] and [`recv`]. All operations block the calling thread.
///
/// Every socket must be [`close`]d once. Using the socket after that, including
/// closing it again, returns an error with [`ErrorKind::Closed`]. If the socket
/// is dropped without closing it, it will be closed then (ignoring any errors).
///
/// [`bind`]: Socket::bind
/// [`listen`]: Socket::listen
/// [`accept`]: Socket::accept
/// [`connect`]: Socket::connect
/// [`send`]: Socket::send
/// [`recv`]: Socket::recv
/// [`close`]: Socket::close
///
/// # Examples
///
/// ```
/// use ssock::net::Socket;
///
/// # fn main() -> ssock::Result<()> {
/// let mut listener = Socket::create()?;
/// listener.bind(0)?;
/// listener.listen(5)?;
/// let port = listener.local_addr()?.port();
///
/// let mut client = Socket::create()?;
/// client.connect("127.0.0.1", port)?;
/// let (mut conn, _peer_address) = listener.accept()?;
///
/// client.send_all(b"hello")?;
/// client.close()?;
///
/// let mut buf = [0; 16];
/// let n = conn.recv(&mut buf)?;
/// assert_eq!(&buf[..n], b"hello");
/// # // Data could be split over multiple calls.
/// # let mut n = n;
/// # while n != 0 { n = conn.recv(&mut buf)?; }
///
/// conn.close()?;
/// listener.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Socket {
    /// `None` once the socket is closed.
    inner: Option<socket2::Socket>,
    handle: Handle,
}

impl Socket {
    /// Create a new TCP socket.
    pub fn create() -> Result<Socket> {
        let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| Error::os(Operation::Create, None, err))?;
        let socket = Socket::from_socket2(socket, Operation::Create)?;
        trace!("created socket: handle={}", socket.handle);
        Ok(socket)
    }

    fn from_socket2(socket: socket2::Socket, op: Operation) -> Result<Socket> {
        let handle = Handle::next();
        trace!("new socket: handle={}, fd={}", handle, socket.as_raw_fd());
        if SEND_FLAGS == 0 {
            set_nosigpipe(&socket).map_err(|err| Error::os(op, Some(handle), err))?;
        }
        Ok(Socket {
            inner: Some(socket),
            handle,
        })
    }

    /// Returns the handle of this socket.
    ///
    /// The handle is kept after the socket is closed.
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns `true` if [`Socket::close`] was called.
    pub const fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns the open socket, or an error if it's closed.
    fn inner(&self, op: Operation) -> Result<(&socket2::Socket, Operation)> {
        match self.inner.as_ref() {
            Some(socket) => Ok((socket, op)),
            None => Err(Error::new(ErrorKind::Closed, op, Some(self.handle))),
        }
    }

    /// Bind the socket to `port` on all local interfaces.
    ///
    /// Using port `0` lets the OS pick a free port, use [`Socket::local_addr`]
    /// to determine which one.
    pub fn bind(&self, port: u16) -> Result<()> {
        let (socket, op) = self.inner(Operation::Bind(port))?;
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        trace!("binding socket: handle={}, address={}", self.handle, address);
        socket
            .bind(&address.into())
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Mark the (bound) socket as listening for incoming connections.
    ///
    /// `backlog` is the maximum number of pending, not yet accepted
    /// connections. Once the backlog is full the OS will refuse new
    /// connections. This can be called again to change the backlog.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        let (socket, op) = self.inner(Operation::Listen(backlog))?;
        trace!("listening on socket: handle={}, backlog={}", self.handle, backlog);
        socket
            .listen(backlog)
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Accept a new connection, blocking until one is available.
    ///
    /// Returns a new socket connected to the peer and the address of the
    /// peer. The listening socket is not affected and can be used to accept
    /// more connections.
    pub fn accept(&self) -> Result<(Socket, SocketAddr)> {
        let (socket, op) = self.inner(Operation::Accept)?;
        trace!("accepting connection: handle={}", self.handle);
        let (stream, address) = socket
            .accept()
            .map_err(|err| Error::os(op.clone(), Some(self.handle), err))?;
        let Some(address) = address.as_socket() else {
            return Err(Error::new(ErrorKind::Transport, op, Some(self.handle)));
        };
        let stream = Socket::from_socket2(stream, op)?;
        trace!(
            "accepted connection: handle={}, accepted_handle={}, remote_address={}",
            self.handle,
            stream.handle,
            address
        );
        Ok((stream, address))
    }

    /// Connect to `host` on `port`, blocking until the connection is
    /// established.
    ///
    /// `host` can be an IPv4 address or host name, it's resolved using the
    /// system's resolver. If the host can't be resolved to an IPv4 address this
    /// returns an error with [`ErrorKind::HostNotFound`], if nobody is listening
    /// on the address an error with [`ErrorKind::ConnectionRefused`].
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let (socket, op) = self.inner(Operation::Connect(host.to_owned(), port))?;
        trace!("resolving host: handle={}, host={}", self.handle, host);
        let address = match (host, port).to_socket_addrs() {
            Ok(mut addresses) => match addresses.find(SocketAddr::is_ipv4) {
                Some(address) => address,
                None => return Err(Error::host_not_found(op, self.handle, None)),
            },
            Err(err) => return Err(Error::host_not_found(op, self.handle, Some(err))),
        };
        trace!("connecting socket: handle={}, address={}", self.handle, address);
        socket
            .connect(&address.into())
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Send the bytes in `buf` to the peer.
    ///
    /// Returns the number of bytes sent, which may be less than `buf.len()`.
    /// See [`Socket::send_all`] to send all bytes.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let (socket, op) = self.inner(Operation::Send(buf.len()))?;
        socket
            .send_with_flags(buf, SEND_FLAGS)
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Send all bytes in `buf`, calling [`Socket::send`] until everything is
    /// sent.
    ///
    /// Interrupted sends are retried.
    pub fn send_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.send(buf) {
                Ok(0) => {
                    let op = Operation::Send(buf.len());
                    return Err(Error::new(ErrorKind::PeerClosed, op, Some(self.handle)));
                }
                Ok(n) => buf = &buf[n..],
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Receive bytes from the peer, writing them into `buf`.
    ///
    /// Returns the number of bytes received, at most `buf.len()` and possibly
    /// less. Zero means the peer closed the connection (or `buf` is empty).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (mut socket, op) = self.inner(Operation::Recv(buf.len()))?;
        socket
            .read(buf)
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Close the socket.
    ///
    /// Even if this returns an error (other than [`ErrorKind::Closed`]) the
    /// socket is considered closed.
    pub fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(socket) => {
                trace!("closing socket: handle={}", self.handle);
                let fd = socket.into_raw_fd();
                syscall!(close(fd))
                    .map(|_| ())
                    .map_err(|err| Error::os(Operation::Close, Some(self.handle), err))
            }
            None => Err(Error::new(ErrorKind::Closed, Operation::Close, Some(self.handle))),
        }
    }

    /// Shuts down the read, write, or both halves of the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let (socket, op) = self.inner(Operation::Other("shutting down"))?;
        socket
            .shutdown(how)
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Returns the local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let (socket, op) = self.inner(Operation::Other("getting local address"))?;
        socket
            .local_addr()
            .map_err(|err| Error::os(op.clone(), Some(self.handle), err))?
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Transport, op, Some(self.handle)))
    }

    /// Returns the address of the peer the socket is connected to.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let (socket, op) = self.inner(Operation::Other("getting peer address"))?;
        socket
            .peer_addr()
            .map_err(|err| Error::os(op.clone(), Some(self.handle), err))?
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Transport, op, Some(self.handle)))
    }

    /// Set the `SO_REUSEADDR` option, must be called before [`Socket::bind`].
    ///
    /// This allows a server to bind to its port again while connections of the
    /// previous server are still in the `TIME_WAIT` state.
    pub fn set_reuse_address(&self, reuse: bool) -> Result<()> {
        let (socket, op) = self.inner(Operation::Other("setting SO_REUSEADDR"))?;
        socket
            .set_reuse_address(reuse)
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }

    /// Create a new `socket2::Socket` referring to the same OS socket.
    ///
    /// Used by [`Shutdown`] to shut down active connections.
    ///
    /// [`Shutdown`]: crate::Shutdown
    pub(crate) fn try_clone_inner(&self) -> Result<socket2::Socket> {
        let (socket, op) = self.inner(Operation::Other("duplicating"))?;
        socket
            .try_clone()
            .map_err(|err| Error::os(op, Some(self.handle), err))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(socket) = self.inner.take() {
            trace!("dropping unclosed socket: handle={}", self.handle);
            drop(socket);
        }
    }
}

#[cfg(any(target_os = "ios", target_os = "macos", target_os = "tvos", target_os = "watchos"))]
fn set_nosigpipe(socket: &socket2::Socket) -> std::io::Result<()> {
    socket.set_nosigpipe(true)
}

#[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "tvos", target_os = "watchos")))]
fn set_nosigpipe(_: &socket2::Socket) -> std::io::Result<()> {
    Ok(())
}
