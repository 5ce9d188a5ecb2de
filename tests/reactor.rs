#![cfg(unix)]

mod util;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use muxio::{BackendKind, Handler, Multiplexer, Reactor, Ready, Socket};
use util::{connected_pair, init, listener, pump_rounds, pump_until, pump_while};

/// Accepts every connection as a counting echo handler.
struct EchoListener {
    socket: Socket,
    connected: Rc<RefCell<usize>>,
}

impl Handler for EchoListener {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn accept(&mut self, peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
        Ok(Some(Box::new(CountingEcho {
            socket: peer,
            connected: Rc::clone(&self.connected),
        })))
    }
}

struct CountingEcho {
    socket: Socket,
    connected: Rc<RefCell<usize>>,
}

impl Handler for CountingEcho {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn ready_read(&mut self) -> io::Result<()> {
        let mut bytes = Vec::new();
        self.socket.read_all(&mut bytes)?;
        if !bytes.is_empty() {
            self.socket.write(&bytes)?;
        }
        Ok(())
    }

    fn connected(&mut self) {
        *self.connected.borrow_mut() += 1;
    }
}

/// A handler with no behaviour beyond the defaults.
struct Sink {
    socket: Socket,
}

impl Handler for Sink {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }
}

#[test]
fn echo_round_trip_and_teardown_on_hangup() {
    init();

    let (socket, addr) = listener();
    let listener_fd = socket.descriptor();
    let connected = Rc::new(RefCell::new(0));

    let mut reactor = Reactor::new().unwrap();
    reactor
        .serve(Box::new(EchoListener {
            socket,
            connected: Rc::clone(&connected),
        }))
        .unwrap();

    let mut peer = TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    pump_until(&mut reactor, || *connected.borrow() == 1);
    assert_eq!(reactor.client_count(), 1);
    assert_eq!(reactor.guest_count(), 1);
    assert!(reactor.is_registered(listener_fd));

    peer.write_all(b"ping").unwrap();

    let mut echoed = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        pump_rounds(&mut reactor, 1);
        match peer.read(&mut echoed[got..]) {
            Ok(0) => panic!("peer closed early"),
            Ok(n) => got += n,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => panic!("read failed: {}", err),
        }
    }
    assert_eq!(&echoed, b"ping");

    // Hanging up tears the accepted socket down without user involvement.
    drop(peer);
    pump_while(&mut reactor, |reactor| reactor.client_count() > 0);
    assert_eq!(reactor.client_count(), 0);
    assert_eq!(reactor.guest_count(), 1);
}

#[test]
fn accept_drains_every_pending_connection() {
    init();

    let (socket, addr) = listener();
    let connected = Rc::new(RefCell::new(0));

    let mut reactor = Reactor::new().unwrap();
    reactor
        .serve(Box::new(EchoListener {
            socket,
            connected: Rc::clone(&connected),
        }))
        .unwrap();

    let streams: Vec<_> = (0..5).map(|_| TcpStream::connect(addr).unwrap()).collect();
    std::thread::sleep(Duration::from_millis(200));

    // One pump is enough: the accept loop runs until would-block.
    reactor.poll(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(reactor.client_count(), 5);
    assert_eq!(*connected.borrow(), 5);
    drop(streams);
}

/// Vetoes the fifth connection by returning no handler for it.
struct PickyListener {
    socket: Socket,
    accepted: Rc<RefCell<usize>>,
    connected: Rc<RefCell<usize>>,
}

impl Handler for PickyListener {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn accept(&mut self, peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
        *self.accepted.borrow_mut() += 1;
        if *self.accepted.borrow() == 5 {
            return Ok(None);
        }
        Ok(Some(Box::new(CountingEcho {
            socket: peer,
            connected: Rc::clone(&self.connected),
        })))
    }
}

#[test]
fn admission_veto_closes_the_rejected_connection() {
    init();

    let (socket, addr) = listener();
    let accepted = Rc::new(RefCell::new(0));
    let connected = Rc::new(RefCell::new(0));

    let mut reactor = Reactor::new().unwrap();
    reactor
        .serve(Box::new(PickyListener {
            socket,
            accepted: Rc::clone(&accepted),
            connected: Rc::clone(&connected),
        }))
        .unwrap();

    let streams: Vec<_> = (0..5).map(|_| TcpStream::connect(addr).unwrap()).collect();
    std::thread::sleep(Duration::from_millis(200));
    pump_until(&mut reactor, || *accepted.borrow() == 5);

    assert_eq!(reactor.client_count(), 4);
    assert_eq!(*connected.borrow(), 4);

    // Exactly one peer observes an immediate close.
    let mut closed = 0;
    for stream in &streams {
        stream.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        // Give the kernel a moment to deliver the FIN.
        std::thread::sleep(Duration::from_millis(20));
        match (&*stream).read(&mut probe) {
            Ok(0) => closed += 1,
            Ok(_) => panic!("unexpected data"),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("probe failed: {}", err),
        }
    }
    assert_eq!(closed, 1);
}

#[test]
fn backpressure_drains_and_reverts_the_watch_mask() {
    init();

    let (mut socket, mut peer) = connected_pair();
    let fd = socket.descriptor();
    // Large enough that kernel send/receive buffers cannot swallow it whole.
    let payload: Vec<u8> = (0..32 * 1024 * 1024).map(|_| rand::random::<u8>()).collect();

    // The peer is not reading, so most of this lands in the output buffer.
    socket.write(&payload).unwrap();
    assert!(socket.pending_write(), "kernel swallowed the whole payload");

    let mux = Multiplexer::with_backend(BackendKind::Poll).unwrap();
    let mut reactor = Reactor::with_multiplexer(mux);
    reactor.serve(Box::new(Sink { socket })).unwrap();
    assert!(reactor.multiplexer().watching(fd).is_writable());

    peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut received = 0;
    let mut chunk = vec![0u8; 64 * 1024];
    while received < payload.len() {
        pump_rounds(&mut reactor, 1);
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => panic!("writer closed early"),
                Ok(n) => received += n,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(err) => panic!("read failed: {}", err),
            }
        }
    }
    assert_eq!(received, payload.len());

    // Once drained, the next writability wakeup reverts the mask without
    // any user involvement.
    pump_while(&mut reactor, |reactor| {
        reactor.multiplexer().watching(fd).is_writable()
    });
    assert_eq!(
        reactor.multiplexer().watching(fd),
        Ready::WATCH_ALL - Ready::WRITABLE
    );
}

#[test]
fn unserve_returns_the_handler_and_unwatches() {
    init();

    let (socket, _peer) = connected_pair();
    let fd = socket.descriptor();

    let mux = Multiplexer::with_backend(BackendKind::Poll).unwrap();
    let mut reactor = Reactor::with_multiplexer(mux);
    reactor.serve(Box::new(Sink { socket })).unwrap();
    assert!(reactor.is_registered(fd));
    assert!(!reactor.multiplexer().watching(fd).is_empty());

    let handler = reactor.unserve(fd).expect("guest not found");
    assert_eq!(handler.socket().descriptor(), fd);
    assert!(!reactor.is_registered(fd));
    assert_eq!(reactor.multiplexer().watching(fd), Ready::EMPTY);
    assert_eq!(reactor.guest_count(), 0);
}

#[test]
fn run_exits_when_cancelled_or_idle() {
    init();

    // No guests: nothing to wait for.
    let mut reactor = Reactor::new().unwrap();
    reactor.run().unwrap();

    // A pre-cancelled reactor does not enter the loop.
    let (socket, _peer) = connected_pair();
    let mut reactor = Reactor::new().unwrap();
    reactor.serve(Box::new(Sink { socket })).unwrap();
    let cancel = reactor.cancel_handle();
    cancel.cancel();
    assert!(cancel.is_cancelled());
    reactor.run().unwrap();
}

#[test]
fn reactor_errors_reach_the_error_callback() {
    init();

    let (socket, addr) = listener();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&errors);

    let mut reactor = Reactor::new().unwrap();
    reactor.on_error(move |err| seen.borrow_mut().push(err.kind()));
    reactor
        .serve(Box::new(FailingListener { socket }))
        .unwrap();

    let _stream = TcpStream::connect(addr).unwrap();
    pump_until(&mut reactor, || !errors.borrow().is_empty());
    assert_eq!(errors.borrow()[0], io::ErrorKind::Other);
    // The failed child never joined the client map.
    assert_eq!(reactor.client_count(), 0);
}

/// A listener whose factory refuses with an error rather than a veto.
struct FailingListener {
    socket: Socket,
}

impl Handler for FailingListener {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    fn accept(&mut self, _peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
        Err(io::Error::new(io::ErrorKind::Other, "factory failed"))
    }
}
