#![allow(dead_code)] // Not all tests use all functions/types.

use std::io;
use std::net::SocketAddr;
use std::os::unix::thread::{JoinHandleExt, RawPthread};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use ssock::server::{Consumer, Server, ServerOptions, Stats};
use ssock::{Result, Shutdown};

/// Maximum time to wait for an event in the tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Event send by [`Collector`].
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    Chunk(SocketAddr, Vec<u8>),
    Closed(SocketAddr),
}

/// [`Consumer`] that sends all events to a channel.
#[derive(Clone)]
pub struct Collector {
    sender: Sender<Event>,
    /// Return an error for chunks starting with this.
    fail_on: Option<&'static [u8]>,
}

impl Collector {
    pub fn new() -> (Collector, Receiver<Event>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Collector {
                sender,
                fail_on: None,
            },
            receiver,
        )
    }

    pub fn fail_on(mut self, prefix: &'static [u8]) -> Collector {
        self.fail_on = Some(prefix);
        self
    }
}

impl Consumer for Collector {
    fn consume(&mut self, peer: SocketAddr, chunk: &[u8]) -> io::Result<()> {
        assert!(!chunk.is_empty(), "got an empty chunk");
        self.sender
            .send(Event::Chunk(peer, chunk.to_vec()))
            .expect("test stopped");
        match self.fail_on {
            Some(prefix) if chunk.starts_with(prefix) => {
                Err(io::Error::new(io::ErrorKind::Other, "consumer failure"))
            }
            _ => Ok(()),
        }
    }

    fn closed(&mut self, peer: SocketAddr) {
        self.sender.send(Event::Closed(peer)).expect("test stopped");
    }
}

/// A server running on a different thread.
pub struct RunningServer {
    pub port: u16,
    pub shutdown: Shutdown,
    handle: JoinHandle<Result<Stats>>,
}

impl RunningServer {
    /// Stop the server, returning its result.
    pub fn stop(self) -> Result<Stats> {
        self.shutdown.trigger();
        self.join()
    }

    /// Returns the thread the server is running on.
    pub fn pthread(&self) -> RawPthread {
        self.handle.as_pthread_t()
    }

    /// Wait for the server to stop, without stopping it.
    pub fn join(self) -> Result<Stats> {
        self.handle.join().expect("server thread panicked")
    }
}

/// Start a server on any port, running [`Server::run`] on another thread.
pub fn start_server<C>(options: ServerOptions, consumer: C) -> RunningServer
where
    C: Consumer + Send + 'static,
{
    spawn_server(options, move |server| server.run(consumer))
}

/// Start a server on any port, running [`Server::run_threaded`] on another
/// thread.
pub fn start_threaded_server<C>(options: ServerOptions, consumer: C) -> RunningServer
where
    C: Consumer + Clone + Send + 'static,
{
    spawn_server(options, move |server| server.run_threaded(consumer))
}

fn spawn_server<F>(options: ServerOptions, run: F) -> RunningServer
where
    F: FnOnce(Server) -> Result<Stats> + Send + 'static,
{
    let server = Server::bind(0, options).expect("failed to bind server");
    let port = server.local_addr().unwrap().port();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || run(server));
    RunningServer {
        port,
        shutdown,
        handle,
    }
}

/// Receive events from `events` until a [`Event::Closed`] is received for
/// `peer`, returning all received bytes for `peer`. Events for other peers are
/// collected in `others`.
#[track_caller]
pub fn collect_connection(
    events: &Receiver<Event>,
    peer: SocketAddr,
    others: &mut Vec<Event>,
) -> Vec<u8> {
    // Events might already have been received.
    let mut received = Vec::new();
    let mut i = 0;
    while i < others.len() {
        let for_peer = match &others[i] {
            Event::Chunk(p, _) | Event::Closed(p) => *p == peer,
        };
        if !for_peer {
            i += 1;
            continue;
        }
        match others.remove(i) {
            Event::Chunk(_, chunk) => received.extend_from_slice(&chunk),
            Event::Closed(_) => return received,
        }
    }

    loop {
        match events.recv_timeout(TIMEOUT).expect("timed out waiting for event") {
            Event::Chunk(p, chunk) if p == peer => received.extend_from_slice(&chunk),
            Event::Closed(p) if p == peer => return received,
            event => others.push(event),
        }
    }
}
