//! Client that sends each line read from standard in to a server.
//!
//! Usage: `ssock-client <host> <port>`.
//!
//! Stops at the end of the input (Ctrl+D).

use std::env;
use std::process::ExitCode;

use ssock::client::{Client, ClientOptions, Lines};
use ssock::log::{self, error, info};

fn main() -> ExitCode {
    log::init();

    let Some((host, port)) = parse_args() else {
        eprintln!("usage: ssock-client <host> <port>");
        return ExitCode::from(2);
    };

    info!("client connecting: host={}, port={}", host, port);
    let client = match Client::connect(&host, port) {
        Ok(client) => client,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    // `Lines` removes the line terminator, add it back so the server can tell
    // the lines apart.
    let options = ClientOptions::default().with_delimiter(Some(b"\n".to_vec()));
    match client.with_options(options).run(Lines::stdin()) {
        Ok(stats) => {
            info!(
                "client done: lines={}, bytes={}",
                stats.payloads, stats.bytes
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn parse_args() -> Option<(String, u16)> {
    let mut args = env::args().skip(1);
    let host = args.next()?;
    let port = args.next()?.parse().ok()?;
    match args.next() {
        Some(_) => None,
        None => Some((host, port)),
    }
}
