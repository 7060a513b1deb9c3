//! Module with [`Server`] and related types.
//!
//! The server runs the following lifecycle:
//!
//! ```text
//! Idle -> Listening -> AwaitingConnection -> Serving -> AwaitingConnection ...
//!                                                    \-> Terminated
//! ```
//!
//! [`Server::bind`] creates, binds and listens on a socket (`Idle ->
//! Listening`). [`Server::run`] accepts connections (`AwaitingConnection`) and
//! serves them (`Serving`) by receiving bytes until the peer closes the
//! connection, handing each chunk to a [`Consumer`]. The server stops
//! (`Terminated`) once its [`Shutdown`] handle is triggered or when accepting
//! a connection fails.
//!
//! [`Server::run`] serves one connection at a time, on the calling thread.
//! [`Server::run_threaded`] serves each connection on its own thread, leaving
//! the calling thread to only accept connections.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace, warn};

use crate::error::{ErrorKind, Result};
use crate::net::Socket;
use crate::Shutdown;

/// Number of bytes of the receive buffer not used for receiving, see
/// [`ServerOptions::with_buffer_size`].
const HEADROOM: usize = 2;

/// Options used to start a [`Server`].
///
/// # Examples
///
/// ```
/// use ssock::server::ServerOptions;
///
/// let options = ServerOptions::default()
///     .with_backlog(16)
///     .with_buffer_size(1024);
/// # drop(options);
/// ```
#[derive(Clone, Debug)]
pub struct ServerOptions {
    backlog: i32,
    buffer_size: usize,
    reuse_address: bool,
}

impl ServerOptions {
    /// Set the backlog of the listening socket, the maximum number of pending
    /// connections. Defaults to 5.
    pub const fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Returns the backlog.
    pub const fn backlog(&self) -> i32 {
        self.backlog
    }

    /// Set the size of the buffer used to receive bytes from a connection.
    /// Defaults to 256.
    ///
    /// The last two bytes of the buffer are never used for receiving, so a
    /// single chunk handed to the [`Consumer`] is at most `size - 2` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is smaller than three.
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        assert!(size > HEADROOM, "buffer size must be at least three bytes");
        self.buffer_size = size;
        self
    }

    /// Returns the receive buffer size.
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Set the `SO_REUSEADDR` option on the listening socket. Defaults to
    /// `true`.
    pub const fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            backlog: 5,
            buffer_size: 256,
            reuse_address: true,
        }
    }
}

/// Consumer of the bytes received by the [`Server`].
///
/// This is implemented for closures that accept the peer's address and the
/// received bytes, see [`Print`] for a consumer that writes the bytes to
/// standard out.
pub trait Consumer {
    /// Handle a chunk of bytes received from `peer`.
    ///
    /// The chunk is never empty. Note that the chunks don't have any relation
    /// to the way the peer sent the bytes, a single send by the peer can be
    /// split into multiple chunks and multiple sends can be combined into a
    /// single chunk.
    ///
    /// If this returns an error the connection is closed.
    fn consume(&mut self, peer: SocketAddr, chunk: &[u8]) -> io::Result<()>;

    /// Called once the connection with `peer` is closed.
    fn closed(&mut self, peer: SocketAddr) {
        let _ = peer;
    }
}

impl<F> Consumer for F
where
    F: FnMut(SocketAddr, &[u8]) -> io::Result<()>,
{
    fn consume(&mut self, peer: SocketAddr, chunk: &[u8]) -> io::Result<()> {
        (self)(peer, chunk)
    }
}

/// [`Consumer`] that prints all bytes received to a writer, by default
/// standard out.
///
/// Each chunk is printed as `Server got this message [<chunk>]`, replacing
/// invalid UTF-8 with `U+FFFD`. The writer is shared between all clones of
/// `Print`, which allows it to be used with [`Server::run_threaded`].
#[derive(Debug)]
pub struct Print<W> {
    output: Arc<Mutex<W>>,
}

impl Print<io::Stdout> {
    /// Print to standard out.
    pub fn stdout() -> Print<io::Stdout> {
        Print::new(io::stdout())
    }
}

impl<W> Print<W> {
    /// Print to `output`.
    pub fn new(output: W) -> Print<W> {
        Print {
            output: Arc::new(Mutex::new(output)),
        }
    }

    /// Returns access to the output.
    pub fn output(&self) -> MutexGuard<'_, W> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W> Clone for Print<W> {
    fn clone(&self) -> Print<W> {
        Print {
            output: self.output.clone(),
        }
    }
}

impl<W: Write> Consumer for Print<W> {
    fn consume(&mut self, _: SocketAddr, chunk: &[u8]) -> io::Result<()> {
        let mut output = self.output();
        writeln!(
            output,
            "Server got this message [{}]",
            String::from_utf8_lossy(chunk)
        )?;
        output.flush()
    }
}

/// Statistics returned by [`Server::run`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Number of connections accepted (and served).
    pub connections: u64,
    /// Total number of bytes received over all connections.
    pub bytes: u64,
}

/// A TCP server that hands everything it receives to a [`Consumer`].
///
/// # Examples
///
/// ```
/// use std::io;
/// use std::net::SocketAddr;
/// use std::thread;
///
/// use ssock::net::Socket;
/// use ssock::server::{Server, ServerOptions};
///
/// # fn main() -> ssock::Result<()> {
/// let server = Server::bind(0, ServerOptions::default())?;
/// let port = server.local_addr()?.port();
/// let shutdown = server.shutdown_handle();
///
/// let handle = thread::spawn(move || {
///     server.run(|peer: SocketAddr, chunk: &[u8]| -> io::Result<()> {
///         println!("got {} bytes from {peer}", chunk.len());
///         Ok(())
///     })
/// });
///
/// let mut client = Socket::create()?;
/// client.connect("localhost", port)?;
/// client.send_all(b"Hello world")?;
/// client.close()?;
///
/// // Stop the server, this will close the listening socket.
/// shutdown.trigger();
/// let stats = handle.join().unwrap()?;
/// # assert!(stats.connections <= 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Server {
    listener: Socket,
    options: ServerOptions,
    shutdown: Shutdown,
}

impl Server {
    /// Create a new server listening on `port` on all interfaces.
    ///
    /// Port `0` lets the OS pick a free port, see [`Server::local_addr`].
    pub fn bind(port: u16, options: ServerOptions) -> Result<Server> {
        debug!("starting server: port={}, backlog={}", port, options.backlog);
        // If any of the steps below fail the socket is closed when dropped.
        let listener = Socket::create()?;
        if options.reuse_address {
            listener.set_reuse_address(true)?;
        }
        listener.bind(port)?;
        listener.listen(options.backlog)?;
        let port = listener.local_addr()?.port();
        let shutdown = Shutdown::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        debug!(
            "server listening: handle={}, port={}",
            listener.handle(),
            port
        );
        Ok(Server {
            listener,
            options,
            shutdown,
        })
    }

    /// Returns the local address of the listening socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns a handle to stop the server once it's running.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the server, accepting connections and serving them using
    /// `consumer` until [`Shutdown::trigger`] is called.
    ///
    /// Connections are served one at a time on the calling thread, a
    /// connection is fully served (until the peer closes it) before the next
    /// one is accepted. As nothing leaves the calling thread `consumer` may
    /// borrow local state. See [`Server::run_threaded`] to serve connections
    /// concurrently.
    ///
    /// Errors on a single connection, e.g. failing to receive or the
    /// `consumer` returning an error, only close that connection. If accepting
    /// a connection fails (for a reason other than being interrupted or the
    /// connection being aborted by the peer) the error is returned.
    ///
    /// The listening socket is closed before returning, for both the `Ok` and
    /// `Err` case.
    pub fn run<C>(self, consumer: C) -> Result<Stats>
    where
        C: Consumer,
    {
        self.run_with(Sequential { consumer })
    }

    /// Same as [`Server::run`], but serves each connection on its own thread.
    ///
    /// Each thread gets its own clone of `consumer`. All threads are joined
    /// before this returns.
    pub fn run_threaded<C>(self, consumer: C) -> Result<Stats>
    where
        C: Consumer + Clone + Send + 'static,
    {
        self.run_with(Threaded {
            consumer,
            workers: Workers::new(),
        })
    }

    fn run_with<D: Dispatch>(mut self, dispatch: D) -> Result<Stats> {
        let result = self.accept_loop(dispatch);
        debug!("stopping server: handle={}", self.listener.handle());
        match (result, self.listener.close()) {
            (Ok(stats), Ok(())) => Ok(stats),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                error!("error closing listening socket: {}", close_err);
                Err(err)
            }
        }
    }

    fn accept_loop<D: Dispatch>(&mut self, mut dispatch: D) -> Result<Stats> {
        let mut stats = Stats::default();
        while !self.shutdown.is_triggered() {
            dispatch.reap(&mut stats);

            let (mut conn, peer) = match self.listener.accept() {
                Ok(ok) => ok,
                Err(ref err) if err.is_retryable() => {
                    debug!("retrying accept: {}", err);
                    continue;
                }
                Err(err) => {
                    let _ = self.shutdown.cancel_connections();
                    dispatch.join_all(&mut stats);
                    return Err(err);
                }
            };

            if self.shutdown.is_triggered() {
                trace!(
                    "dropping connection accepted during shutdown: handle={}, remote_address={}",
                    conn.handle(),
                    peer
                );
                if let Err(err) = conn.close() {
                    warn!("error closing connection: {}", err);
                }
                break;
            }

            let conn = Connection {
                socket: conn,
                peer,
                buffer_size: self.options.buffer_size,
                shutdown: self.shutdown.clone(),
            };
            if dispatch.dispatch(conn, &mut stats) {
                stats.connections += 1;
            }
        }
        dispatch.join_all(&mut stats);
        debug!(
            "server shutdown: connections={}, bytes={}",
            stats.connections, stats.bytes
        );
        Ok(stats)
    }
}

/// An accepted connection, ready to be served.
struct Connection {
    socket: Socket,
    peer: SocketAddr,
    buffer_size: usize,
    shutdown: Shutdown,
}

/// The way the [`Server`] serves accepted connections.
trait Dispatch {
    /// Serve `conn`, returns `false` if the connection was dropped without
    /// serving it.
    fn dispatch(&mut self, conn: Connection, stats: &mut Stats) -> bool;

    /// Collect the statistics of connections that are done.
    fn reap(&mut self, stats: &mut Stats) {
        let _ = stats;
    }

    /// Wait for all connections to be done.
    fn join_all(&mut self, stats: &mut Stats) {
        let _ = stats;
    }
}

/// Serves connections on the accepting thread.
struct Sequential<C> {
    consumer: C,
}

impl<C: Consumer> Dispatch for Sequential<C> {
    fn dispatch(&mut self, conn: Connection, stats: &mut Stats) -> bool {
        stats.bytes += serve(conn, &mut self.consumer);
        true
    }
}

/// Serves each connection on its own thread.
struct Threaded<C> {
    consumer: C,
    workers: Workers,
}

impl<C> Dispatch for Threaded<C>
where
    C: Consumer + Clone + Send + 'static,
{
    fn dispatch(&mut self, conn: Connection, _: &mut Stats) -> bool {
        self.workers.spawn(conn, self.consumer.clone())
    }

    fn reap(&mut self, stats: &mut Stats) {
        self.workers.reap(stats);
    }

    fn join_all(&mut self, stats: &mut Stats) {
        self.workers.join_all(stats);
    }
}

/// Serve a single connection, receiving bytes until the peer closes the
/// connection. Returns the number of bytes received.
fn serve<C>(conn: Connection, consumer: &mut C) -> u64
where
    C: Consumer,
{
    let Connection {
        socket: mut conn,
        peer,
        buffer_size,
        shutdown,
    } = conn;
    let handle = conn.handle();
    debug!("serving connection: handle={}, remote_address={}", handle, peer);
    let registration = match shutdown.register(&conn) {
        Ok(registration) => Some(registration),
        Err(err) => {
            warn!("connection not stopped on shutdown: {}: handle={}", err, handle);
            None
        }
    };

    let mut buf = vec![0; buffer_size];
    let capacity = buffer_size - HEADROOM;
    let mut bytes = 0;
    loop {
        match conn.recv(&mut buf[..capacity]) {
            Ok(0) => {
                debug!("peer closed connection: handle={}, remote_address={}", handle, peer);
                break;
            }
            Ok(n) => {
                trace!("received bytes: handle={}, n={}", handle, n);
                bytes += n as u64;
                if let Err(err) = consumer.consume(peer, &buf[..n]) {
                    error!(
                        "error consuming bytes, closing connection: {}: handle={}, remote_address={}",
                        err, handle, peer
                    );
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if err.kind() == ErrorKind::PeerClosed {
                    debug!("{}: remote_address={}", err, peer);
                } else {
                    error!("{}: remote_address={}", err, peer);
                }
                break;
            }
        }
    }

    // Must drop the duplicated socket before closing, otherwise the peer never
    // sees the connection being closed.
    drop(registration);
    consumer.closed(peer);
    if let Err(err) = conn.close() {
        error!("{}: remote_address={}", err, peer);
    }
    bytes
}

/// Threads serving connections for [`Server::run_threaded`].
struct Workers {
    /// Next id for a worker.
    next_id: u64,
    /// Running (or finished but not yet joined) workers.
    running: HashMap<u64, JoinHandle<u64>>,
    /// Workers send their id once they're done.
    done_sender: Sender<u64>,
    done: Receiver<u64>,
}

impl Workers {
    fn new() -> Workers {
        let (done_sender, done) = crossbeam_channel::unbounded();
        Workers {
            next_id: 0,
            running: HashMap::new(),
            done_sender,
            done,
        }
    }

    /// Start a new thread serving `conn`. Returns `false` if the thread
    /// couldn't be started, in which case the connection is closed.
    fn spawn<C>(&mut self, conn: Connection, mut consumer: C) -> bool
    where
        C: Consumer + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let peer = conn.peer;
        let done = self.done_sender.clone();
        let result = thread::Builder::new()
            .name(format!("ssock-conn-{id}"))
            .spawn(move || {
                let bytes = serve(conn, &mut consumer);
                // Can only fail if the server stopped, in which case it will
                // join us anyway.
                let _ = done.send(id);
                bytes
            });
        match result {
            Ok(handle) => {
                trace!("started worker thread: id={}, remote_address={}", id, peer);
                let _ = self.running.insert(id, handle);
                true
            }
            // NOTE: the connection is dropped (and thus closed) along with the
            // closure.
            Err(err) => {
                error!(
                    "error starting thread to serve connection: {}: remote_address={}",
                    err, peer
                );
                false
            }
        }
    }

    /// Join all workers that are done.
    fn reap(&mut self, stats: &mut Stats) {
        while let Ok(id) = self.done.try_recv() {
            if let Some(handle) = self.running.remove(&id) {
                join(id, handle, stats);
            }
        }
    }

    /// Join all workers, waiting for them to finish.
    fn join_all(&mut self, stats: &mut Stats) {
        for (id, handle) in self.running.drain() {
            join(id, handle, stats);
        }
    }
}

fn join(id: u64, handle: JoinHandle<u64>, stats: &mut Stats) {
    match handle.join() {
        Ok(bytes) => {
            trace!("joined worker thread: id={}", id);
            stats.bytes += bytes;
        }
        Err(panic) => error!(
            "worker thread panicked: id={}, panic={}",
            id,
            panic_message(&*panic)
        ),
    }
}

/// Attempts to extract a message from a panic, defaulting to `<unknown>`.
/// NOTE: be sure to derefence the `Box`!
fn panic_message<'a>(panic: &'a (dyn std::any::Any + Send + 'static)) -> &'a str {
    match panic.downcast_ref::<&'static str>() {
        Some(s) => s,
        None => match panic.downcast_ref::<String>() {
            Some(s) => s,
            None => "<unknown>",
        },
    }
}
