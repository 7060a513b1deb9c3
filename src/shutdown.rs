//! Module with [`Shutdown`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::{fmt, net};

use log::{debug, trace};
use socket2::{Domain, Protocol, Type};

use crate::net::{Handle, Socket};

/// Maximum time to wait for the connection that wakes up the accept loop.
const WAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to stop a running [`Server`].
///
/// The `Shutdown` handle can be retrieved using [`Server::shutdown_handle`]
/// and can be cheaply cloned and send across threads. Calling
/// [`Shutdown::trigger`] stops the server:
///
///  * a blocked [`Socket::accept`] is woken up, after which the server closes
///    its listening socket and [`Server::run`] returns, and
///  * all active connections are shut down, so that any blocked
///    [`Socket::recv`] returns zero.
///
/// To trigger a shutdown on a process signal see [`SignalWatcher`].
///
/// [`Server`]: crate::Server
/// [`Server::shutdown_handle`]: crate::Server::shutdown_handle
/// [`Server::run`]: crate::Server::run
/// [`SignalWatcher`]: crate::signal::SignalWatcher
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    /// Loopback address of the server's listener, used to wake up a blocked
    /// `accept` call.
    wake_address: SocketAddr,
    /// Duplicates of the sockets of all active connections.
    connections: Mutex<HashMap<Handle, socket2::Socket>>,
}

impl Shutdown {
    /// Create a new `Shutdown` for a listener that can be reached on
    /// `wake_address`.
    pub(crate) fn new(wake_address: SocketAddr) -> Shutdown {
        Shutdown {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                wake_address,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns `true` if [`Shutdown::trigger`] was called.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Stop the server.
    ///
    /// Calling this more than once has no effect.
    pub fn trigger(&self) {
        if !self.cancel_connections() {
            return;
        }

        // Wake up the accept loop, it will see that we're triggered.
        let address = self.inner.wake_address;
        let socket = match socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("failed to wake server for shutdown: {}", err);
                return;
            }
        };
        // If the backlog is full the connection is never accepted, but then
        // the accept loop isn't blocked either.
        if let Err(err) = socket.connect_timeout(&address.into(), WAKE_TIMEOUT) {
            trace!("failed to wake server for shutdown: {}: address={}", err, address);
        }
    }

    /// Mark the shutdown as triggered and shut down all active connections,
    /// without waking the accept loop.
    ///
    /// Returns `false` if the shutdown was already triggered.
    pub(crate) fn cancel_connections(&self) -> bool {
        if self.inner.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("shutdown triggered, shutting down active connections");
        for (handle, socket) in self.connections().iter() {
            shutdown_connection(*handle, socket);
        }
        true
    }

    /// Register an active connection, it will be shut down once triggered.
    ///
    /// The connection is deregistered once the returned [`Registration`] is
    /// dropped. The connection socket must not be closed before that, as the
    /// duplicated socket keeps the connection open.
    pub(crate) fn register(&self, conn: &Socket) -> crate::Result<Registration> {
        let handle = conn.handle();
        let socket = conn.try_clone_inner()?;
        let already_triggered = {
            let mut connections = self.connections();
            let socket = connections.entry(handle).or_insert(socket);
            // If we got triggered before we added the connection to the map
            // we have to shut it down ourselves.
            let triggered = self.is_triggered();
            if triggered {
                shutdown_connection(handle, socket);
            }
            triggered
        };
        trace!(
            "registered connection: handle={}, shutdown_triggered={}",
            handle,
            already_triggered
        );
        Ok(Registration {
            shutdown: self.clone(),
            handle,
        })
    }

    /// Returns the number of registered, i.e. active, connections.
    #[cfg(test)]
    pub(crate) fn active_connections(&self) -> usize {
        self.connections().len()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Handle, socket2::Socket>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutdown_connection(handle: Handle, socket: &socket2::Socket) {
    trace!("shutting down connection: handle={}", handle);
    if let Err(err) = socket.shutdown(net::Shutdown::Both) {
        // Likely the peer already closed the connection.
        trace!("failed to shut down connection: {}: handle={}", err, handle);
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .field("wake_address", &self.inner.wake_address)
            .finish()
    }
}

/// Registration of an active connection, see [`Shutdown::register`].
#[derive(Debug)]
pub(crate) struct Registration {
    shutdown: Shutdown,
    handle: Handle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Drops (closes) the duplicated socket.
        drop(self.shutdown.connections().remove(&self.handle));
        trace!("deregistered connection: handle={}", self.handle);
    }
}
