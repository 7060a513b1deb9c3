//! Logging related types.
//!
//! Logging in ssock is done via the [`log`] crate, much like the entire Rust
//! ecosystem does (or should). However the log crate doesn't provide an actual
//! logging implementation, it only defines macros for it. Those macros are
//! re-exported here, which means that the macros in the `log` crate can also be
//! used.
//!
//! The actual logging implementation comes from the [`std-logger`] crate. Logs
//! are written to standard error, leaving standard out for the output of the
//! applications. The log level can be changed using the `LOG_LEVEL`
//! environment variable, e.g. `LOG_LEVEL=debug` shows every connection and
//! `LOG_LEVEL=trace` every socket operation.
//!
//! To enable logging call [`init`].
//!
//! [`log`]: https://crates.io/crates/log
//! [`std-logger`]: std_logger
//!
//! # Examples
//!
//! Enabling logging.
//!
//! ```
//! use ssock::log::{self, info};
//!
//! // Enable logging.
//! log::init();
//!
//! info!("Hello world");
//! ```

#[doc(no_inline)]
pub use log::{debug, error, info, log, log_enabled, trace, warn};

/// Initialise logging, using the logfmt format.
///
/// # Panics
///
/// This will panic if a logger was already set.
pub fn init() {
    std_logger::Config::logfmt().init();
}
