use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use ssock::net::Socket;
use ssock::server::{Consumer, Print, Server, ServerOptions};
use ssock::ErrorKind;

use crate::util::{
    collect_connection, start_server, start_threaded_server, Collector, Event, RunningServer,
    TIMEOUT,
};

const DATA: &[u8] = b"Hello world";

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

#[test]
fn sequential_sessions() {
    let (collector, events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector);
    let mut others = Vec::new();

    for msg in [&b"first"[..], b"second session"] {
        let mut stream = connect(server.port);
        let peer = stream.local_addr().unwrap();
        stream.write_all(msg).unwrap();
        drop(stream);
        assert_eq!(collect_connection(&events, peer, &mut others), msg);
    }
    assert!(others.is_empty());

    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.bytes, (5 + 14) as u64);
}

#[test]
fn chunks_are_limited_by_buffer_headroom() {
    let (collector, events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector);

    let payload = vec![b'x'; 1000];
    let mut stream = connect(server.port);
    let peer = stream.local_addr().unwrap();
    stream.write_all(&payload).unwrap();
    drop(stream);

    let mut received = 0;
    loop {
        match events.recv_timeout(TIMEOUT).unwrap() {
            Event::Chunk(p, chunk) => {
                assert_eq!(p, peer);
                assert!(!chunk.is_empty() && chunk.len() <= 254, "{}", chunk.len());
                received += chunk.len();
            }
            Event::Closed(p) => {
                assert_eq!(p, peer);
                break;
            }
        }
    }
    assert_eq!(received, payload.len());

    let stats = server.stop().unwrap();
    assert_eq!(stats.bytes, payload.len() as u64);
}

#[test]
fn custom_buffer_size() {
    let (collector, events) = Collector::new();
    let options = ServerOptions::default().with_buffer_size(10);
    let server = start_server(options, collector);

    let mut stream = connect(server.port);
    let peer = stream.local_addr().unwrap();
    stream.write_all(DATA).unwrap();
    drop(stream);

    let mut received = Vec::new();
    loop {
        match events.recv_timeout(TIMEOUT).unwrap() {
            Event::Chunk(_, chunk) => {
                assert!(chunk.len() <= 8);
                received.extend_from_slice(&chunk);
            }
            Event::Closed(p) => {
                assert_eq!(p, peer);
                break;
            }
        }
    }
    assert_eq!(received, DATA);
    server.stop().unwrap();
}

#[test]
fn threaded_serves_concurrently() {
    let (collector, events) = Collector::new();
    let server = start_threaded_server(ServerOptions::default(), collector);

    // With `Server::run` the second connection would never be served
    // while the first is still open.
    let mut first = connect(server.port);
    let first_peer = first.local_addr().unwrap();
    first.write_all(b"first").unwrap();

    let mut second = connect(server.port);
    let second_peer = second.local_addr().unwrap();
    second.write_all(b"second").unwrap();
    drop(second);

    let mut others = Vec::new();
    assert_eq!(collect_connection(&events, second_peer, &mut others), b"second");

    drop(first);
    assert_eq!(collect_connection(&events, first_peer, &mut others), b"first");
    assert!(others.is_empty());

    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.bytes, 11);
}

#[test]
fn threaded_many_clients() {
    const CLIENTS: usize = 8;

    let (collector, events) = Collector::new();
    let options = ServerOptions::default().with_backlog(CLIENTS as i32);
    let server = start_threaded_server(options, collector);
    let port = server.port;

    let handles: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = connect(port);
                let msg = format!("client {i}");
                stream.write_all(msg.as_bytes()).unwrap();
                (stream.local_addr().unwrap(), msg)
            })
        })
        .collect();

    let mut others = Vec::new();
    for handle in handles {
        let (peer, msg) = handle.join().unwrap();
        assert_eq!(
            collect_connection(&events, peer, &mut others),
            msg.as_bytes()
        );
    }
    assert!(others.is_empty());

    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, CLIENTS as u64);
}

#[test]
fn consumer_error_closes_only_that_connection() {
    let (collector, events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector.fail_on(b"fail"));

    let mut stream = connect(server.port);
    let peer = stream.local_addr().unwrap();
    stream.write_all(b"fail").unwrap();
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap(),
        Event::Chunk(peer, b"fail".to_vec())
    );
    assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), Event::Closed(peer));
    // The server closed the connection.
    let mut buf = [0; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    // The server is still accepting connections.
    let mut stream = connect(server.port);
    let peer = stream.local_addr().unwrap();
    stream.write_all(DATA).unwrap();
    drop(stream);
    let mut others = Vec::new();
    assert_eq!(collect_connection(&events, peer, &mut others), DATA);

    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, 2);
}

#[test]
fn shutdown_while_accepting() {
    let (collector, events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector);
    let port = server.port;

    // Give the server some time to block in accept.
    thread::sleep(Duration::from_millis(50));
    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.bytes, 0);
    assert!(events.try_recv().is_err());

    // The listener is closed.
    let mut client = Socket::create().unwrap();
    let err = client.connect("127.0.0.1", port).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused, "{err}");
    client.close().unwrap();
}

#[test]
fn shutdown_with_idle_connection() {
    let (collector, events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector);
    stop_with_idle_connection(server, events);
}

#[test]
fn threaded_shutdown_with_idle_connection() {
    let (collector, events) = Collector::new();
    let server = start_threaded_server(ServerOptions::default(), collector);
    stop_with_idle_connection(server, events);
}

fn stop_with_idle_connection(server: RunningServer, events: Receiver<Event>) {
    let mut stream = connect(server.port);
    let peer = stream.local_addr().unwrap();
    stream.write_all(DATA).unwrap();
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap(),
        Event::Chunk(peer, DATA.to_vec())
    );

    // The client keeps the connection open, but the server must still stop.
    let stats = server.stop().unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.bytes, DATA.len() as u64);
    assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), Event::Closed(peer));

    let mut buf = [0; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn consumer_borrowing_local_state() {
    let server = Server::bind(0, ServerOptions::default()).unwrap();
    let port = server.local_addr().unwrap().port();
    let shutdown = server.shutdown_handle();

    let mut received = Vec::new();
    let mut closed = 0;
    let stats = thread::scope(|s| {
        let _ = s.spawn(|| {
            let mut stream = connect(port);
            stream.write_all(DATA).unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            // Wait for the server to close the connection.
            let mut buf = [0; 8];
            assert_eq!(stream.read(&mut buf).unwrap(), 0);
            shutdown.trigger();
        });

        struct Local<'a> {
            received: &'a mut Vec<u8>,
            closed: &'a mut usize,
        }

        impl<'a> Consumer for Local<'a> {
            fn consume(&mut self, _: SocketAddr, chunk: &[u8]) -> io::Result<()> {
                self.received.extend_from_slice(chunk);
                Ok(())
            }

            fn closed(&mut self, _: SocketAddr) {
                *self.closed += 1;
            }
        }

        let consumer = Local {
            received: &mut received,
            closed: &mut closed,
        };
        server.run(consumer)
    })
    .unwrap();

    assert_eq!(received, DATA);
    assert_eq!(closed, 1);
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.bytes, DATA.len() as u64);
}

#[test]
fn shutdown_with_full_backlog() {
    let (collector, _events) = Collector::new();
    let options = ServerOptions::default().with_backlog(1);
    let server = start_server(options, collector);
    let address = SocketAddr::from(([127, 0, 0, 1], server.port));

    // The first connection is served (and stays idle), the others fill the
    // backlog.
    let streams: Vec<TcpStream> = (0..4)
        .filter_map(|_| TcpStream::connect_timeout(&address, Duration::from_millis(100)).ok())
        .collect();
    assert!(!streams.is_empty());

    let start = Instant::now();
    let stats = server.stop().unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(1), "stopping took {elapsed:?}");
    assert!(stats.connections <= streams.len() as u64);
}

#[test]
fn trigger_before_run() {
    let server = Server::bind(0, ServerOptions::default()).unwrap();
    let shutdown = server.shutdown_handle();
    shutdown.trigger();
    assert!(shutdown.is_triggered());

    let stats = server.run(Print::new(Vec::new())).unwrap();
    assert_eq!(stats.connections, 0);
}

#[test]
fn bind_any_port() {
    let server = Server::bind(0, ServerOptions::default()).unwrap();
    let address = server.local_addr().unwrap();
    assert_ne!(address.port(), 0);

    // Reachable on the reported port.
    let stream = connect(address.port());
    drop(stream);
    server.shutdown_handle().trigger();
    let stats = server.run(Print::new(Vec::new())).unwrap();
    assert_eq!(stats.connections, 0);
}

#[test]
fn bind_address_in_use() {
    let (collector, _events) = Collector::new();
    let server = start_server(ServerOptions::default(), collector);

    let err = Server::bind(server.port, ServerOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddressInUse, "{err}");

    server.stop().unwrap();
}

#[test]
fn print_output() {
    let print = Print::new(Vec::new());
    let server = Server::bind(0, ServerOptions::default()).unwrap();
    let port = server.local_addr().unwrap().port();
    let shutdown = server.shutdown_handle();
    let output = print.clone();
    let handle = thread::spawn(move || server.run(print));

    let mut stream = connect(port);
    stream.write_all(b"hello").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    // Wait for the server to close the connection.
    let mut buf = [0; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    shutdown.trigger();
    let stats = handle.join().unwrap().unwrap();
    assert_eq!(stats.connections, 1);

    let output = String::from_utf8(output.output().clone()).unwrap();
    // The bytes can be received in multiple chunks.
    let mut received = String::new();
    for line in output.lines() {
        let msg = line
            .strip_prefix("Server got this message [")
            .and_then(|line| line.strip_suffix(']'))
            .unwrap();
        received.push_str(msg);
    }
    assert_eq!(received, "hello");
}
