//! Module with [`Client`] and related types.
//!
//! The client runs the following lifecycle:
//!
//! ```text
//! Idle -> Connected -> Sending -> Terminated
//! ```
//!
//! [`Client::connect`] creates a socket and connects it (`Idle ->
//! Connected`). [`Client::run`] sends every payload a [`Producer`] yields over
//! that single connection (`Sending`) and closes it once the producer is
//! exhausted (`Terminated`).

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::{error, fmt};

use log::{debug, trace, warn};

use crate::net::Socket;

/// Source of the payloads send by the [`Client`].
pub trait Producer {
    /// Returns the next payload to send, or `None` once there is nothing left
    /// to send.
    fn next_payload(&mut self) -> io::Result<Option<Vec<u8>>>;
}

impl<P> Producer for &mut P
where
    P: Producer + ?Sized,
{
    fn next_payload(&mut self) -> io::Result<Option<Vec<u8>>> {
        (**self).next_payload()
    }
}

/// [`Producer`] that yields the lines read from a reader, one line at a time.
///
/// The line terminator (`\n` or `\r\n`) is removed from the line.
///
/// # Examples
///
/// ```
/// use ssock::client::{Lines, Producer};
///
/// # fn main() -> std::io::Result<()> {
/// let mut lines = Lines::new(&b"Hello\r\nworld\n!"[..]);
/// assert_eq!(lines.next_payload()?.as_deref(), Some(&b"Hello"[..]));
/// assert_eq!(lines.next_payload()?.as_deref(), Some(&b"world"[..]));
/// assert_eq!(lines.next_payload()?.as_deref(), Some(&b"!"[..]));
/// assert_eq!(lines.next_payload()?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Lines<R> {
    reader: R,
}

impl<R: BufRead> Lines<R> {
    /// Read lines from `reader`.
    pub const fn new(reader: R) -> Lines<R> {
        Lines { reader }
    }
}

impl Lines<io::StdinLock<'static>> {
    /// Read lines from standard in.
    pub fn stdin() -> Lines<io::StdinLock<'static>> {
        Lines::new(io::stdin().lock())
    }
}

impl<R: BufRead> Producer for Lines<R> {
    fn next_payload(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            let _ = line.pop();
            if line.last() == Some(&b'\r') {
                let _ = line.pop();
            }
        }
        Ok(Some(line))
    }
}

/// [`Producer`] that yields the payloads from an iterator.
#[derive(Debug)]
pub struct Payloads<I> {
    iter: I,
}

impl<I> Payloads<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    /// Yield the payloads from `iter`.
    pub fn new<T>(iter: T) -> Payloads<I>
    where
        T: IntoIterator<IntoIter = I>,
    {
        Payloads {
            iter: iter.into_iter(),
        }
    }
}

impl<I> Producer for Payloads<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    fn next_payload(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.iter.next())
    }
}

/// Options used by the [`Client`].
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    delimiter: Option<Vec<u8>>,
}

impl ClientOptions {
    /// Send `delimiter` after each payload. Defaults to `None`, sending the
    /// payloads as is.
    ///
    /// Note that [`Lines`] removes the line terminator, use `b"\n"` to send
    /// the lines as lines.
    pub fn with_delimiter(mut self, delimiter: Option<Vec<u8>>) -> Self {
        self.delimiter = delimiter;
        self
    }
}

/// Statistics returned by [`Client::run`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Number of payloads sent.
    pub payloads: u64,
    /// Total number of bytes sent, including delimiters.
    pub bytes: u64,
}

/// A TCP client that sends everything a [`Producer`] yields over a single
/// connection.
///
/// # Examples
///
/// ```
/// use std::io::Read;
/// use std::net::TcpListener;
///
/// use ssock::client::{Client, ClientOptions, Payloads};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let port = listener.local_addr()?.port();
///
/// let client = Client::connect("127.0.0.1", port)?
///     .with_options(ClientOptions::default().with_delimiter(Some(b"\n".to_vec())));
/// let (mut stream, _) = listener.accept()?;
///
/// let payloads = Payloads::new(vec![b"Hello".to_vec(), b"world".to_vec()]);
/// let stats = client.run(payloads)?;
/// assert_eq!(stats.payloads, 2);
///
/// let mut received = String::new();
/// stream.read_to_string(&mut received)?;
/// assert_eq!(received, "Hello\nworld\n");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    socket: Socket,
    options: ClientOptions,
}

impl Client {
    /// Connect to `host` on `port`.
    pub fn connect(host: &str, port: u16) -> crate::Result<Client> {
        debug!("client connecting: host={}, port={}", host, port);
        // If connecting fails the socket is closed when dropped.
        let socket = Socket::create()?;
        socket.connect(host, port)?;
        debug!(
            "client connected: handle={}, host={}, port={}",
            socket.handle(),
            host,
            port
        );
        Ok(Client {
            socket,
            options: ClientOptions::default(),
        })
    }

    /// Use `options` for this client.
    pub fn with_options(mut self, options: ClientOptions) -> Client {
        self.options = options;
        self
    }

    /// Returns the local address of the connection.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Returns the address of the server.
    pub fn peer_addr(&self) -> crate::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Send all payloads `producer` yields, closing the connection once the
    /// producer returns `None`.
    ///
    /// If sending or the producer fails the connection is closed and the error
    /// returned.
    pub fn run<P>(mut self, mut producer: P) -> Result<Stats, Error>
    where
        P: Producer,
    {
        let result = self.send_loop(&mut producer);
        debug!("client closing connection: handle={}", self.socket.handle());
        match (result, self.socket.close()) {
            (Ok(stats), Ok(())) => Ok(stats),
            (Ok(_), Err(err)) => Err(Error::Socket(err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!("error closing connection: {}", close_err);
                Err(err)
            }
        }
    }

    fn send_loop<P>(&mut self, producer: &mut P) -> Result<Stats, Error>
    where
        P: Producer,
    {
        let mut stats = Stats::default();
        while let Some(payload) = producer.next_payload().map_err(Error::Producer)? {
            trace!(
                "sending payload: handle={}, length={}",
                self.socket.handle(),
                payload.len()
            );
            self.socket.send_all(&payload)?;
            stats.bytes += payload.len() as u64;
            if let Some(delimiter) = self.options.delimiter.as_deref() {
                self.socket.send_all(delimiter)?;
                stats.bytes += delimiter.len() as u64;
            }
            stats.payloads += 1;
        }
        debug!(
            "client done sending: payloads={}, bytes={}",
            stats.payloads, stats.bytes
        );
        Ok(stats)
    }
}

/// Error returned by [`Client::run`].
#[derive(Debug)]
#[allow(variant_size_differences)] // Can't make `Socket` smaller.
pub enum Error {
    /// Error sending, or closing the connection.
    Socket(crate::Error),
    /// Error returned by the [`Producer`].
    Producer(io::Error),
}

impl From<crate::Error> for Error {
    fn from(err: crate::Error) -> Error {
        Error::Socket(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Socket(err) => fmt::Display::fmt(err, f),
            Error::Producer(err) => write!(f, "error producing payload: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Socket(err) => Some(err),
            Error::Producer(err) => Some(err),
        }
    }
}
