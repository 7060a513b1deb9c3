//! Server that prints everything it receives to standard out.
//!
//! Usage: `ssock-server <port>`.
//!
//! Stops on an interrupt (Ctrl+C), terminate or quit signal.

use std::env;
use std::process::ExitCode;

use ssock::log::{self, error, info, warn};
use ssock::server::{Print, Server, ServerOptions};
use ssock::signal::SignalWatcher;

fn main() -> ExitCode {
    log::init();

    let Some(port) = parse_port() else {
        eprintln!("usage: ssock-server <port>");
        return ExitCode::from(2);
    };

    // NOTE: must be created before any other thread is started.
    let signals = match SignalWatcher::new() {
        Ok(signals) => signals,
        Err(err) => {
            error!("failed to setup signal handling: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(port, ServerOptions::default()) {
        Ok(server) => server,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    match server.local_addr() {
        Ok(address) => info!("server listening: address={}", address),
        Err(err) => warn!("server listening, but failed to get its address: {}", err),
    }

    if let Err(err) = signals.watch(server.shutdown_handle()) {
        error!("failed to start signal handling thread: {}", err);
        return ExitCode::FAILURE;
    }

    match server.run(Print::stdout()) {
        Ok(stats) => {
            info!(
                "server stopped: connections={}, bytes={}",
                stats.connections, stats.bytes
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn parse_port() -> Option<u16> {
    let mut args = env::args().skip(1);
    let port = args.next()?.parse().ok()?;
    match args.next() {
        Some(_) => None,
        None => Some(port),
    }
}
