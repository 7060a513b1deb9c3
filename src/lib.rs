//! Simple blocking TCP sockets.
//!
//! ## About
//!
//! This crate hides the details of setting up and using TCP sockets for simple
//! client-server communication. It comes in three layers:
//!
//!  * [`net::Socket`]: thin wrappers around the OS socket calls (create, bind,
//!    listen, accept, connect, send, receive and close), each returning a
//!    [`Result`] with an [`Error`] that names the failing operation,
//!  * [`Server`]: an accept loop that hands every chunk of bytes received on a
//!    connection to a [`Consumer`], and
//!  * [`Client`]: a single connection that sends everything a [`Producer`]
//!    yields.
//!
//! The server and client don't depend on each other, they only communicate
//! over the network. Neither imposes any framing on the bytes sent.
//!
//! [`Consumer`]: server::Consumer
//! [`Producer`]: client::Producer
//!
//! ## Examples
//!
//! A server printing everything it receives and a client sending it a single
//! line.
//!
//! ```
//! use std::io;
//! use std::net::SocketAddr;
//! use std::thread;
//!
//! use ssock::client::{Client, Lines};
//! use ssock::server::{Server, ServerOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Port 0 means the OS will pick a port for us.
//! let server = Server::bind(0, ServerOptions::default())?;
//! let port = server.local_addr()?.port();
//! let shutdown = server.shutdown_handle();
//!
//! let handle = thread::spawn(move || {
//!     server.run(|peer: SocketAddr, chunk: &[u8]| -> io::Result<()> {
//!         println!("{peer} sent: {}", String::from_utf8_lossy(chunk));
//!         Ok(())
//!     })
//! });
//!
//! let client = Client::connect("localhost", port)?;
//! client.run(Lines::new(&b"Hello world\n"[..]))?;
//!
//! shutdown.trigger();
//! let stats = handle.join().unwrap()?;
//! # assert!(stats.connections <= 1);
//! # Ok(())
//! # }
//! ```

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences
)]
// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]
// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)? ) ) => {{
        let res = unsafe { libc::$fn($( $arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod client;
pub mod error;
pub mod log;
pub mod net;
pub mod server;
pub mod shutdown;
pub mod signal;

#[doc(no_inline)]
pub use client::Client;
#[doc(no_inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(no_inline)]
pub use server::{Server, ServerOptions};
#[doc(no_inline)]
pub use shutdown::Shutdown;
