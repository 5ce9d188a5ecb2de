// Not all functions are used by all tests.
#![allow(dead_code)]

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::time::Duration;

use muxio::{Reactor, Socket};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// A listening socket on an ephemeral local port, already non-blocking and
/// wrapped, plus the address to connect to.
pub fn listener() -> (Socket, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind listener");
    let addr = listener.local_addr().expect("no local address");
    let mut socket = Socket::from(listener);
    socket
        .set_blocking(false)
        .expect("unable to make listener non-blocking");
    (socket, addr)
}

/// A connected pair: a non-blocking wrapped socket on one side and the raw
/// `std` stream on the other.
pub fn connected_pair() -> (Socket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind listener");
    let addr = listener.local_addr().expect("no local address");
    let peer = TcpStream::connect(addr).expect("unable to connect");
    let (accepted, _) = listener.accept().expect("unable to accept");

    let mut socket = Socket::from(accepted);
    socket
        .set_blocking(false)
        .expect("unable to make socket non-blocking");
    (socket, peer)
}

/// Connect to `addr` and wrap the stream non-blocking.
pub fn client_socket(addr: std::net::SocketAddr) -> Socket {
    let stream = TcpStream::connect(addr).expect("unable to connect");
    let mut socket = Socket::from(stream);
    socket
        .set_blocking(false)
        .expect("unable to make socket non-blocking");
    socket
}

/// Pump `reactor` with short timeouts until `done` reports true.
///
/// Panics when the condition is still false after a few seconds; the
/// condition closure runs between pumps, exactly where cancellation would.
pub fn pump_until(reactor: &mut Reactor, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        match reactor.poll(Some(Duration::from_millis(10))) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => panic!("reactor poll failed: {}", err),
        }
    }
    panic!("condition not reached before the pump limit");
}

/// Pump `reactor` until `done(reactor)` reports true, for conditions that
/// inspect the reactor itself.
pub fn pump_while(reactor: &mut Reactor, mut keep_going: impl FnMut(&Reactor) -> bool) {
    for _ in 0..500 {
        if !keep_going(reactor) {
            return;
        }
        match reactor.poll(Some(Duration::from_millis(10))) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => panic!("reactor poll failed: {}", err),
        }
    }
    panic!("condition not reached before the pump limit");
}

/// Pump `reactor` a fixed number of quiet rounds, for tests asserting that
/// nothing further happens.
pub fn pump_rounds(reactor: &mut Reactor, rounds: usize) {
    for _ in 0..rounds {
        match reactor.poll(Some(Duration::from_millis(10))) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => panic!("reactor poll failed: {}", err),
        }
    }
}
