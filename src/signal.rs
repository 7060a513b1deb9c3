//! Module with [`Signal`] and [`SignalWatcher`].
//!
//! The [`SignalWatcher`] translates process signals into a
//! [`Shutdown::trigger`] call, allowing a [`Server`] to stop cleanly (closing
//! its listening socket) when the process is interrupted.
//!
//! [`Server`]: crate::Server

use std::thread::{self, JoinHandle};
use std::{fmt, io};

use log::{debug, error, trace};
use mio::{Events, Interest, Poll, Token};
use mio_signals::{SignalSet, Signals};

use crate::Shutdown;

/// Process signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Signal {
    /// Interrupt signal.
    ///
    /// This signal is received by the process when its controlling terminal
    /// wishes to interrupt the process. This signal will for example be send
    /// when Ctrl+C is pressed in most terminals.
    ///
    /// Corresponds to POSIX signal `SIGINT`.
    Interrupt,
    /// Termination request signal.
    ///
    /// This signal received when the process is requested to terminate. This
    /// allows the process to perform nice termination, releasing resources and
    /// saving state if appropriate. This signal will be send when using the
    /// `kill` command for example.
    ///
    /// Corresponds to POSIX signal `SIGTERM`.
    Terminate,
    /// Terminal quit signal.
    ///
    /// This signal is received when the process is requested to quit and
    /// perform a core dump.
    ///
    /// Corresponds to POSIX signal `SIGQUIT`.
    Quit,
}

impl Signal {
    /// Convert a [`mio_signals::Signal`] into our own `Signal`.
    ///
    /// Returns `None` for signals that don't stop the process.
    fn from_mio(signal: mio_signals::Signal) -> Option<Signal> {
        match signal {
            mio_signals::Signal::Interrupt => Some(Signal::Interrupt),
            mio_signals::Signal::Terminate => Some(Signal::Terminate),
            mio_signals::Signal::Quit => Some(Signal::Quit),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alternate = f.alternate();
        f.write_str(match (self, alternate) {
            (Signal::Interrupt, false) => "interrupt",
            (Signal::Interrupt, true) => "interrupt (SIGINT)",
            (Signal::Terminate, false) => "terminate",
            (Signal::Terminate, true) => "terminate (SIGTERM)",
            (Signal::Quit, false) => "quit",
            (Signal::Quit, true) => "quit (SIGQUIT)",
        })
    }
}

/// Token used to receive process signals.
const SIGNAL: Token = Token(0);

/// Set of signals we're listening for.
fn signal_set() -> SignalSet {
    mio_signals::Signal::Interrupt | mio_signals::Signal::Terminate | mio_signals::Signal::Quit
}

/// Watches for process signals and triggers a [`Shutdown`] when one arrives.
///
/// # Notes
///
/// On Linux the signals are blocked for the calling thread and every thread
/// spawned afterwards, which means this **must** be created before spawning
/// any other thread.
#[derive(Debug)]
pub struct SignalWatcher {
    poll: Poll,
    signals: Signals,
}

impl SignalWatcher {
    /// Create a new `SignalWatcher`, starting to catch process signals.
    pub fn new() -> io::Result<SignalWatcher> {
        let poll = Poll::new()?;
        let set = signal_set();
        trace!("setting up signal handling: signals={:?}", set);
        let mut signals = Signals::new(set)?;
        poll.registry()
            .register(&mut signals, SIGNAL, Interest::READABLE)?;
        Ok(SignalWatcher { poll, signals })
    }

    /// Start a thread that waits for a process signal and then calls
    /// [`Shutdown::trigger`] on `shutdown`.
    ///
    /// The thread stops after the first signal, returning it.
    pub fn watch(self, shutdown: Shutdown) -> io::Result<JoinHandle<Option<Signal>>> {
        thread::Builder::new()
            .name("ssock-signals".to_owned())
            .spawn(move || match self.wait() {
                Ok(signal) => {
                    debug!("received process signal, shutting down: signal={:#}", signal);
                    shutdown.trigger();
                    Some(signal)
                }
                Err(err) => {
                    error!("error waiting for process signals: {}", err);
                    None
                }
            })
    }

    /// Block until a process signal is received.
    pub fn wait(mut self) -> io::Result<Signal> {
        let mut events = Events::with_capacity(4);
        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                trace!("got OS event: {:?}", event);
                if event.token() != SIGNAL {
                    continue;
                }
                while let Some(signal) = self.signals.receive()? {
                    match Signal::from_mio(signal) {
                        Some(signal) => return Ok(signal),
                        None => debug!("ignoring process signal: signal={:?}", signal),
                    }
                }
            }
        }
    }
}
